//! VMDK sparse extent handling.
//!
//! This module provides the text descriptor model, the sparse header
//! validator for existing files, and the stream-optimized writer.

pub mod descriptor;
pub mod info;
pub mod layout;
pub mod sparse;
pub mod stream;

pub use descriptor::{format_bytes, parse_descriptor, ContentId, Descriptor, Extent, Permission};
pub use info::{seek, stat, Info};
pub use layout::{GRAIN_SIZE, GRAIN_SIZE_BYTES, GT_ENTRIES_PER_GT, SECTOR_SIZE};
pub use sparse::{GrainLbaHeader, MetaDataMarker, SparseExtentHeader, VMDK_MAGIC};
pub use stream::{
    compress_grain, CancelToken, CompressionLevel, StreamOptimizedWriter, WriterOptions,
};
