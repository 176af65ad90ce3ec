//! vmdkstream Core Library
//!
//! This crate reads and writes stream-optimized sparse VMDK disk images.
//!
//! # Overview
//!
//! A stream-optimized VMDK starts with a 512-byte sparse extent header and
//! an embedded text descriptor, followed by independently zlib-compressed
//! grains and the grain directory/tables that locate them. Grains that are
//! entirely zero are not stored.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`vmdk`] - Descriptor model, header validation and the stream-optimized writer
//! - [`ovf`] - OVF import envelope for a single disk
//!
//! # Quick Start
//!
//! ```no_run
//! use std::fs::File;
//! use std::path::Path;
//! use vmdkstream_core::vmdk::{stat, StreamOptimizedWriter};
//!
//! let raw = File::open("disk.img").unwrap();
//! let capacity = raw.metadata().unwrap().len();
//!
//! let mut writer = StreamOptimizedWriter::create(Path::new("disk.vmdk"), capacity).unwrap();
//! writer.write(raw).unwrap();
//! writer.close().unwrap();
//!
//! let info = stat(Path::new("disk.vmdk")).unwrap();
//! println!("{} bytes, {} extents", info.capacity, info.descriptor.extents.len());
//! ```

pub mod error;
pub mod ovf;
pub mod vmdk;

pub use error::{Error, Result};

// Re-export the main entry points for convenience
pub use vmdk::{
    parse_descriptor, seek, stat, CancelToken, CompressionLevel, Descriptor, Info,
    StreamOptimizedWriter, WriterOptions,
};
