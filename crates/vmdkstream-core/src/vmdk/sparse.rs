//! On-disk records of a sparse VMDK extent.
//!
//! Each record is encoded field by field at fixed byte offsets in
//! little-endian order. Nothing here depends on in-memory struct layout.

use super::layout::{
    DESCRIPTOR_OFFSET, DESCRIPTOR_SECTORS, GD_OFFSET, GRAIN_SIZE, GT_ENTRIES_PER_GT, SECTOR_SIZE,
};

/// VMDK magic number ("VMDK" as little-endian u32).
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// Header version written for stream-optimized extents.
pub const STREAM_OPTIMIZED_VERSION: u32 = 3;

/// Valid newline detection test.
pub const FLAG_VALID_NEWLINE: u32 = 1 << 0;
/// Grains are compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 16;
/// Each grain carries an embedded LBA header.
pub const FLAG_EMBEDDED_LBA: u32 = 1 << 17;

/// Compression algorithm id for zlib/deflate.
pub const COMPRESS_ALGORITHM_DEFLATE: u16 = 1;

/// Metadata marker sector type for the end of the stream.
pub const MARKER_END_OF_STREAM: u32 = 0;

/// Size in bytes of [`SparseExtentHeader`] on disk.
pub const HEADER_SIZE: usize = SECTOR_SIZE as usize;

/// Size in bytes of [`GrainLbaHeader`] on disk.
pub const GRAIN_LBA_HEADER_SIZE: usize = 12;

/// Size in bytes of [`MetaDataMarker`] on disk.
pub const MARKER_SIZE: usize = SECTOR_SIZE as usize;

// Byte offsets of the header fields.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_CAPACITY: usize = 12;
const OFF_GRAIN_SIZE: usize = 20;
const OFF_DESCRIPTOR_OFFSET: usize = 28;
const OFF_DESCRIPTOR_SIZE: usize = 36;
const OFF_NUM_GTES_PER_GT: usize = 44;
const OFF_RGD_OFFSET: usize = 48;
const OFF_GD_OFFSET: usize = 56;
const OFF_OVERHEAD: usize = 64;
const OFF_UNCLEAN_SHUTDOWN: usize = 72;
const OFF_SINGLE_END_LINE: usize = 73;
const OFF_NON_END_LINE: usize = 74;
const OFF_DOUBLE_END_LINE_1: usize = 75;
const OFF_DOUBLE_END_LINE_2: usize = 76;
const OFF_COMPRESS_ALGORITHM: usize = 77;
// 79..512 is padding (433 bytes).

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Sparse extent header, the first sector of a sparse VMDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    /// Magic number (VMDK_MAGIC).
    pub magic: u32,
    /// Format version.
    pub version: u32,
    /// Feature flags.
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Descriptor offset in sectors.
    pub descriptor_offset: u64,
    /// Descriptor size in sectors.
    pub descriptor_size: u64,
    /// Number of grain table entries per grain table.
    pub num_gtes_per_gt: u32,
    /// Redundant grain directory offset in sectors.
    pub rgd_offset: u64,
    /// Grain directory offset in sectors.
    pub gd_offset: u64,
    /// Sectors reserved before the first grain.
    pub overhead: u64,
    /// Unclean shutdown flag.
    pub unclean_shutdown: u8,
    /// Newline detection characters: `\n`, ` `, `\r`, `\n`.
    pub newline_chars: [u8; 4],
    /// Compression algorithm (1 = DEFLATE).
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Creates a stream-optimized header.
    ///
    /// # Arguments
    ///
    /// * `capacity_bytes` - Virtual disk capacity in bytes.
    /// * `overhead` - Sectors reserved ahead of grain data.
    pub fn stream_optimized(capacity_bytes: u64, overhead: u64) -> Self {
        Self {
            magic: VMDK_MAGIC,
            version: STREAM_OPTIMIZED_VERSION,
            flags: FLAG_COMPRESSED | FLAG_EMBEDDED_LBA | FLAG_VALID_NEWLINE,
            capacity: capacity_bytes / SECTOR_SIZE,
            grain_size: GRAIN_SIZE,
            descriptor_offset: DESCRIPTOR_OFFSET,
            descriptor_size: DESCRIPTOR_SECTORS,
            num_gtes_per_gt: GT_ENTRIES_PER_GT as u32,
            rgd_offset: 0,
            gd_offset: GD_OFFSET,
            overhead,
            unclean_shutdown: 0,
            newline_chars: [b'\n', b' ', b'\r', b'\n'],
            compress_algorithm: COMPRESS_ALGORITHM_DEFLATE,
        }
    }

    /// Decodes a header from its 512-byte on-disk form.
    ///
    /// No validation is done here; see [`crate::vmdk::seek`].
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: read_u32(buf, OFF_MAGIC),
            version: read_u32(buf, OFF_VERSION),
            flags: read_u32(buf, OFF_FLAGS),
            capacity: read_u64(buf, OFF_CAPACITY),
            grain_size: read_u64(buf, OFF_GRAIN_SIZE),
            descriptor_offset: read_u64(buf, OFF_DESCRIPTOR_OFFSET),
            descriptor_size: read_u64(buf, OFF_DESCRIPTOR_SIZE),
            num_gtes_per_gt: read_u32(buf, OFF_NUM_GTES_PER_GT),
            rgd_offset: read_u64(buf, OFF_RGD_OFFSET),
            gd_offset: read_u64(buf, OFF_GD_OFFSET),
            overhead: read_u64(buf, OFF_OVERHEAD),
            unclean_shutdown: buf[OFF_UNCLEAN_SHUTDOWN],
            newline_chars: [
                buf[OFF_SINGLE_END_LINE],
                buf[OFF_NON_END_LINE],
                buf[OFF_DOUBLE_END_LINE_1],
                buf[OFF_DOUBLE_END_LINE_2],
            ],
            compress_algorithm: read_u16(buf, OFF_COMPRESS_ALGORITHM),
        }
    }

    /// Serializes the header to exactly 512 bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        buf[OFF_CAPACITY..OFF_CAPACITY + 8].copy_from_slice(&self.capacity.to_le_bytes());
        buf[OFF_GRAIN_SIZE..OFF_GRAIN_SIZE + 8].copy_from_slice(&self.grain_size.to_le_bytes());
        buf[OFF_DESCRIPTOR_OFFSET..OFF_DESCRIPTOR_OFFSET + 8]
            .copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[OFF_DESCRIPTOR_SIZE..OFF_DESCRIPTOR_SIZE + 8]
            .copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[OFF_NUM_GTES_PER_GT..OFF_NUM_GTES_PER_GT + 4]
            .copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        buf[OFF_RGD_OFFSET..OFF_RGD_OFFSET + 8].copy_from_slice(&self.rgd_offset.to_le_bytes());
        buf[OFF_GD_OFFSET..OFF_GD_OFFSET + 8].copy_from_slice(&self.gd_offset.to_le_bytes());
        buf[OFF_OVERHEAD..OFF_OVERHEAD + 8].copy_from_slice(&self.overhead.to_le_bytes());
        buf[OFF_UNCLEAN_SHUTDOWN] = self.unclean_shutdown;
        buf[OFF_SINGLE_END_LINE] = self.newline_chars[0];
        buf[OFF_NON_END_LINE] = self.newline_chars[1];
        buf[OFF_DOUBLE_END_LINE_1] = self.newline_chars[2];
        buf[OFF_DOUBLE_END_LINE_2] = self.newline_chars[3];
        buf[OFF_COMPRESS_ALGORITHM..OFF_COMPRESS_ALGORITHM + 2]
            .copy_from_slice(&self.compress_algorithm.to_le_bytes());
        buf
    }

    /// Check if grains are compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Check if grains carry an embedded LBA header.
    pub fn has_embedded_lba(&self) -> bool {
        (self.flags & FLAG_EMBEDDED_LBA) != 0
    }

    /// Capacity in bytes, or `None` if it does not fit in a `u64`.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.capacity.checked_mul(SECTOR_SIZE)
    }
}

/// Header preceding each compressed grain payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainLbaHeader {
    /// Logical block address of the grain (in sectors).
    pub lba: u64,
    /// Size of the compressed grain data in bytes.
    pub cmp_size: u32,
}

impl GrainLbaHeader {
    /// Creates a new grain header.
    pub fn new(lba: u64, cmp_size: u32) -> Self {
        Self { lba, cmp_size }
    }

    /// Serializes the grain header to 12 bytes.
    pub fn to_bytes(&self) -> [u8; GRAIN_LBA_HEADER_SIZE] {
        let mut buf = [0u8; GRAIN_LBA_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.lba.to_le_bytes());
        buf[8..12].copy_from_slice(&self.cmp_size.to_le_bytes());
        buf
    }

    /// Decodes a grain header from 12 bytes.
    pub fn from_bytes(buf: &[u8; GRAIN_LBA_HEADER_SIZE]) -> Self {
        Self {
            lba: read_u64(buf, 0),
            cmp_size: read_u32(buf, 8),
        }
    }
}

/// A 512-byte metadata marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaDataMarker {
    /// Number of metadata sectors following the marker.
    pub num_sectors: u64,
    /// Unused for metadata markers.
    pub size: u32,
    /// Kind of metadata that follows.
    pub sector_type: u32,
}

impl MetaDataMarker {
    /// The end-of-stream marker.
    pub fn end_of_stream() -> Self {
        Self {
            num_sectors: 0,
            size: 0,
            sector_type: MARKER_END_OF_STREAM,
        }
    }

    /// Serializes the marker to 512 bytes.
    pub fn to_bytes(&self) -> [u8; MARKER_SIZE] {
        let mut buf = [0u8; MARKER_SIZE];
        buf[0..8].copy_from_slice(&self.num_sectors.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sector_type.to_le_bytes());
        buf
    }

    /// Decodes a marker from 512 bytes.
    pub fn from_bytes(buf: &[u8; MARKER_SIZE]) -> Self {
        Self {
            num_sectors: read_u64(buf, 0),
            size: read_u32(buf, 8),
            sector_type: read_u32(buf, 12),
        }
    }

    /// Whether this marks the end of the stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.sector_type == MARKER_END_OF_STREAM
    }
}
