//! Inspection of existing stream-optimized VMDK files.
//!
//! [`seek`] validates the sparse header and parses the embedded descriptor;
//! [`stat`] does the same for a path and adds file metadata for uploads.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};

use super::descriptor::{parse_descriptor, Descriptor};
use super::layout::SECTOR_SIZE;
use super::sparse::{SparseExtentHeader, HEADER_SIZE, VMDK_MAGIC};

/// File suffix removed to form the import name.
const VMDK_SUFFIX: &str = ".vmdk";

/// Header, descriptor and file metadata of a stream-optimized VMDK.
#[derive(Debug, Clone)]
pub struct Info {
    /// The decoded sparse extent header.
    pub header: SparseExtentHeader,
    /// The embedded text descriptor.
    pub descriptor: Descriptor,
    /// Virtual disk capacity in bytes.
    pub capacity: u64,
    /// File size in bytes, for use as the upload content length.
    pub size: u64,
    /// File base name.
    pub name: String,
    /// `name` without the `.vmdk` suffix.
    pub import_name: String,
}

impl Info {
    /// Writes the embedded descriptor text to `w`.
    pub fn write<W: Write>(&self, w: W) -> Result<()> {
        self.descriptor.render(w)
    }
}

/// Reads the sparse header and embedded descriptor from `reader`.
///
/// Exactly one header sector is consumed, followed by one sector of
/// descriptor text. `size`, `name` and `import_name` are left empty.
///
/// # Errors
///
/// Returns [`Error::InvalidFormat`] if the magic number is wrong, the
/// grains are not compressed or the capacity does not fit in bytes, and an
/// I/O error if the reader runs short.
pub fn seek<R: Read>(mut reader: R) -> Result<Info> {
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).map_err(Error::io_simple)?;

    let header = SparseExtentHeader::from_bytes(&buf);

    if header.magic != VMDK_MAGIC {
        return Err(Error::invalid_format(format!(
            "bad magic number 0x{:08X}",
            header.magic
        )));
    }

    if !header.is_compressed() {
        // Convert first, e.g. qemu-img convert -O vmdk -o subformat=streamOptimized
        return Err(Error::invalid_format(format!(
            "grains are not compressed (flags 0x{:08X})",
            header.flags
        )));
    }

    debug!(
        "sparse header: version {} capacity {} sectors flags 0x{:08X}",
        header.version, header.capacity, header.flags
    );

    let capacity = header.capacity_bytes().ok_or_else(|| {
        Error::invalid_format(format!(
            "capacity of {} sectors overflows",
            header.capacity
        ))
    })?;
    let descriptor = parse_descriptor(reader.take(SECTOR_SIZE))?;

    Ok(Info {
        header,
        descriptor,
        capacity,
        size: 0,
        name: String::new(),
        import_name: String::new(),
    })
}

/// Opens `path` and calls [`seek`], then fills in file metadata.
///
/// `size` is set to the file length, `name` to the file base name and
/// `import_name` to `name` with a trailing `.vmdk` removed.
pub fn stat(path: &Path) -> Result<Info> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;

    let mut info = seek(&file).map_err(|e| match e {
        Error::Io { source, path: None } => Error::io(source, path),
        other => other,
    })?;

    let metadata = file.metadata().map_err(|e| Error::io(e, path))?;
    drop(file);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    info.size = metadata.len();
    info.import_name = name.strip_suffix(VMDK_SUFFIX).unwrap_or(&name).to_string();
    info.name = name;

    Ok(info)
}
