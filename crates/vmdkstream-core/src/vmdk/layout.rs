//! Grain arithmetic for stream-optimized sparse extents.
//!
//! Every function here is a pure function of the virtual disk capacity in
//! bytes. The writer calls them once when it is created and never again.

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Grain size in sectors (128 sectors = 64KB).
pub const GRAIN_SIZE: u64 = 128;

/// Grain size in bytes.
pub const GRAIN_SIZE_BYTES: u64 = GRAIN_SIZE * SECTOR_SIZE;

/// Number of grain table entries per grain table.
pub const GT_ENTRIES_PER_GT: u64 = 512;

/// Sectors reserved for each grain table.
pub const GT_SECTORS: u64 = 4;

/// Size in bytes of a grain directory entry as sized by the layout.
pub const GD_ENTRY_SIZE: u64 = 4;

/// Size in bytes of each directory/table entry written on close.
pub const METADATA_ENTRY_SIZE: u64 = 8;

/// Sector holding the embedded text descriptor.
pub const DESCRIPTOR_OFFSET: u64 = 1;

/// Sectors reserved for the embedded text descriptor.
pub const DESCRIPTOR_SECTORS: u64 = 20;

/// Sector where the grain directory starts: header + descriptor.
pub const GD_OFFSET: u64 = DESCRIPTOR_OFFSET + DESCRIPTOR_SECTORS;

/// Number of whole grains that fit in `capacity` bytes.
///
/// Any remainder smaller than one grain is not represented.
pub fn grains(capacity: u64) -> u64 {
    capacity / GRAIN_SIZE_BYTES
}

/// Number of grain tables needed to cover every grain.
pub fn grain_tables(capacity: u64) -> u64 {
    grains(capacity).div_ceil(GT_ENTRIES_PER_GT)
}

/// Size of the grain directory in sectors.
pub fn grain_directory_sectors(capacity: u64) -> u64 {
    (grain_tables(capacity) * GD_ENTRY_SIZE).div_ceil(SECTOR_SIZE)
}

/// Start sector of each grain table, 4 sectors apart, right after the directory.
pub fn grain_table_locations(capacity: u64) -> Vec<u64> {
    let first = GD_OFFSET + grain_directory_sectors(capacity);
    (0..grain_tables(capacity))
        .map(|i| first + i * GT_SECTORS)
        .collect()
}

/// Sectors the directory and tables occupy when written as one flat list
/// of 8-byte entries.
pub fn flat_metadata_sectors(capacity: u64) -> u64 {
    ((grain_tables(capacity) + grains(capacity)) * METADATA_ENTRY_SIZE).div_ceil(SECTOR_SIZE)
}

/// Sectors reserved ahead of the first grain.
///
/// This is header + descriptor + directory + 4 sectors per table, widened
/// when the flat metadata list would not fit in that space.
pub fn overhead_sectors(capacity: u64) -> u64 {
    let tables = grain_directory_sectors(capacity) + grain_tables(capacity) * GT_SECTORS;
    GD_OFFSET + tables.max(flat_metadata_sectors(capacity))
}
