//! StreamOptimized VMDK writer.
//!
//! Converts a raw disk image into a stream-optimized sparse extent in one
//! sequential pass:
//! - header, embedded descriptor and a reserved metadata region
//! - one zlib-compressed record per non-zero grain, appended in grain order
//! - an end-of-stream marker
//! - grain directory and grain tables written back into the reserved region
//!
//! Any failure while writing removes the partial output file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info, warn};

use crate::error::{Error, Result};

use super::descriptor::{Descriptor, Extent};
use super::layout::{
    grain_table_locations, grains, overhead_sectors, DESCRIPTOR_OFFSET, DESCRIPTOR_SECTORS,
    GRAIN_SIZE, GRAIN_SIZE_BYTES, SECTOR_SIZE,
};
use super::sparse::{GrainLbaHeader, MetaDataMarker, SparseExtentHeader};

/// Create type written into generated descriptors.
pub const STREAM_OPTIMIZED_CREATE_TYPE: &str = "streamOptimized";

/// Compression level for grain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Fast compression (zlib level 1).
    Fast,
    /// Balanced compression (zlib level 6).
    #[default]
    Balanced,
    /// Maximum compression (zlib level 9).
    Max,
}

impl CompressionLevel {
    /// The zlib level for this setting.
    pub fn level(&self) -> u32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 6,
            CompressionLevel::Max => 9,
        }
    }
}

impl From<CompressionLevel> for Compression {
    fn from(level: CompressionLevel) -> Self {
        Compression::new(level.level())
    }
}

/// A shareable flag used to interrupt a running [`StreamOptimizedWriter::write`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The writer stops before its next grain.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Options for the stream-optimized writer.
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Compression level for grain data.
    pub compression: CompressionLevel,
    /// Optional token checked before each grain.
    pub cancel: Option<CancelToken>,
}

impl WriterOptions {
    /// Create options with the given compression level and no cancel token.
    pub fn new(compression: CompressionLevel) -> Self {
        Self {
            compression,
            cancel: None,
        }
    }

    /// Create options optimized for speed.
    pub fn fast() -> Self {
        Self::new(CompressionLevel::Fast)
    }

    /// Create options optimized for compression ratio.
    pub fn max_compression() -> Self {
        Self::new(CompressionLevel::Max)
    }

    /// Attach a cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Compresses one grain with zlib into `out`, replacing its contents.
pub fn compress_grain(data: &[u8], level: Compression, out: &mut Vec<u8>) -> io::Result<()> {
    out.clear();
    let mut encoder = ZlibEncoder::new(out, level);
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(())
}

/// Writes stream-optimized VMDK files.
///
/// The writer owns its output file. Call [`write`](Self::write) once with
/// the raw image, then [`close`](Self::close) to finalize, or
/// [`abort`](Self::abort) to discard the output.
///
/// # Example
///
/// ```no_run
/// use std::fs::File;
/// use std::path::Path;
/// use vmdkstream_core::vmdk::StreamOptimizedWriter;
///
/// let raw = File::open("disk.img").unwrap();
/// let capacity = raw.metadata().unwrap().len();
///
/// let mut writer = StreamOptimizedWriter::create(Path::new("disk.vmdk"), capacity).unwrap();
/// writer.write(raw).unwrap();
/// writer.close().unwrap();
/// ```
pub struct StreamOptimizedWriter {
    /// Output file; `None` once the writer has been aborted.
    file: Option<BufWriter<File>>,
    path: PathBuf,
    header: SparseExtentHeader,
    /// Virtual disk capacity in bytes.
    capacity: u64,
    /// Current position in the file (in bytes).
    position: u64,
    /// Sector offset of each grain, 0 for grains that were not written.
    grain_table: Vec<u64>,
    /// Start sector of each grain table.
    grain_directory: Vec<u64>,
    options: WriterOptions,
}

impl StreamOptimizedWriter {
    /// Creates the output file and computes the layout for `capacity` bytes.
    pub fn create(path: &Path, capacity: u64) -> Result<Self> {
        Self::create_with_options(path, capacity, WriterOptions::default())
    }

    /// Like [`create`](Self::create) with explicit options.
    pub fn create_with_options(path: &Path, capacity: u64, options: WriterOptions) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::io(e, path))?;

        let header = SparseExtentHeader::stream_optimized(capacity, overhead_sectors(capacity));
        let grain_directory = grain_table_locations(capacity);
        let grain_table = vec![0u64; grains(capacity) as usize];

        info!(
            "creating {}: {} grains in {} grain tables, overhead {} sectors",
            path.display(),
            grain_table.len(),
            grain_directory.len(),
            header.overhead
        );

        Ok(Self {
            file: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
            header,
            capacity,
            position: 0,
            grain_table,
            grain_directory,
            options,
        })
    }

    /// Streams the raw image from `reader` into the file.
    ///
    /// Reading stops at end of input or once every grain slot is filled.
    /// All-zero grains are not stored. A trailing partial grain and any
    /// input beyond the last grain are dropped.
    ///
    /// On failure the output file is removed before the error is returned.
    pub fn write<R: Read>(&mut self, mut reader: R) -> Result<()> {
        if let Err(e) = self.write_metadata() {
            return Err(self.fail(e));
        }

        let level: Compression = self.options.compression.into();
        let mut grain = vec![0u8; GRAIN_SIZE_BYTES as usize];
        let mut compressed = Vec::with_capacity(GRAIN_SIZE_BYTES as usize);
        let mut stored = 0u64;

        for index in 0..self.grain_table.len() as u64 {
            if self.is_cancelled() {
                warn!("write to {} cancelled at grain {}", self.path.display(), index);
                return Err(self.fail(Error::Cancelled));
            }

            let n = match read_grain(&mut reader, &mut grain) {
                Ok(n) => n,
                Err(e) => return Err(self.fail(Error::io_simple(e))),
            };
            if n < grain.len() {
                if n > 0 {
                    warn!("dropping {} trailing bytes of partial grain {}", n, index);
                }
                break;
            }

            if is_zeroed(&grain) {
                self.grain_table[index as usize] = 0;
                continue;
            }

            if let Err(source) = compress_grain(&grain, level, &mut compressed) {
                return Err(self.fail(Error::Compression {
                    grain: index,
                    source,
                }));
            }

            if let Err(e) = self.write_grain(index, &compressed) {
                return Err(self.fail(e));
            }
            stored += 1;
        }

        debug!(
            "wrote {} of {} grains to {}",
            stored,
            self.grain_table.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Finalizes the file: end-of-stream marker, grain directory and tables.
    pub fn close(mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::vmdk("writer was aborted"))?;

        let marker = MetaDataMarker::end_of_stream();
        file.write_all(&marker.to_bytes())
            .map_err(|e| Error::io(e, &self.path))?;

        file.seek(SeekFrom::Start(self.header.gd_offset * SECTOR_SIZE))
            .map_err(|e| Error::io(e, &self.path))?;

        // Directory entries followed directly by every grain's entry, in order.
        let mut metadata =
            Vec::with_capacity((self.grain_directory.len() + self.grain_table.len()) * 8);
        for entry in self.grain_directory.iter().chain(self.grain_table.iter()) {
            metadata.extend_from_slice(&entry.to_le_bytes());
        }
        file.write_all(&metadata)
            .map_err(|e| Error::io(e, &self.path))?;

        file.flush().map_err(|e| Error::io(e, &self.path))?;
        let file = file
            .into_inner()
            .map_err(|e| Error::io(e.into_error(), &self.path))?;
        file.sync_all().map_err(|e| Error::io(e, &self.path))?;

        info!("finalized {}", self.path.display());
        Ok(())
    }

    /// Closes and removes the partial output file.
    pub fn abort(mut self) -> Result<()> {
        self.discard()
    }

    /// Returns the virtual disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the number of grains the file can hold.
    pub fn grain_count(&self) -> u64 {
        self.grain_table.len() as u64
    }

    /// Returns the sparse extent header written at the start of the file.
    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// Returns the sector offset of each grain (0 = not stored).
    pub fn grain_table(&self) -> &[u64] {
        &self.grain_table
    }

    /// Returns the start sector of each grain table.
    pub fn grain_directory(&self) -> &[u64] {
        &self.grain_directory
    }

    /// Returns the output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }

    fn file_mut(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::vmdk("writer was aborted"))
    }

    /// Writes the header, descriptor and the zeroed metadata reservation.
    fn write_metadata(&mut self) -> Result<()> {
        let descriptor = self.descriptor();
        let mut text = Vec::new();
        descriptor.render(&mut text)?;

        let descriptor_bytes = (DESCRIPTOR_SECTORS * SECTOR_SIZE) as usize;
        if text.len() > descriptor_bytes {
            return Err(Error::vmdk(format!(
                "descriptor is {} bytes, only {} reserved",
                text.len(),
                descriptor_bytes
            )));
        }
        text.resize(descriptor_bytes, 0);

        let reserved = (self.header.overhead - DESCRIPTOR_OFFSET - DESCRIPTOR_SECTORS) * SECTOR_SIZE;
        let header = self.header.to_bytes();
        let path = self.path.clone();

        let file = self.file_mut()?;
        file.write_all(&header).map_err(|e| Error::io(e, &path))?;
        file.write_all(&text).map_err(|e| Error::io(e, &path))?;
        io::copy(&mut io::repeat(0).take(reserved), file).map_err(|e| Error::io(e, &path))?;

        self.position = self.header.overhead * SECTOR_SIZE;
        Ok(())
    }

    /// The descriptor embedded in the file: one SPARSE extent over the capacity.
    fn descriptor(&self) -> Descriptor {
        let info = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut descriptor = Descriptor::new(vec![Extent::new(self.header.capacity, "SPARSE", info)]);
        descriptor.create_type = STREAM_OPTIMIZED_CREATE_TYPE.to_string();
        descriptor
    }

    /// Appends one grain record, padded to the next sector boundary.
    fn write_grain(&mut self, index: u64, compressed: &[u8]) -> Result<()> {
        let cmp_size = u32::try_from(compressed.len())
            .map_err(|_| Error::vmdk(format!("grain {} compressed to {} bytes", index, compressed.len())))?;
        let grain_header = GrainLbaHeader::new(index * GRAIN_SIZE, cmp_size);

        let sector = self.position / SECTOR_SIZE;
        let record = (grain_header.to_bytes().len() + compressed.len()) as u64;
        let padding = (SECTOR_SIZE - record % SECTOR_SIZE) % SECTOR_SIZE;
        let path = self.path.clone();

        let file = self.file_mut()?;
        file.write_all(&grain_header.to_bytes())
            .map_err(|e| Error::io(e, &path))?;
        file.write_all(compressed).map_err(|e| Error::io(e, &path))?;
        io::copy(&mut io::repeat(0).take(padding), file).map_err(|e| Error::io(e, &path))?;

        self.grain_table[index as usize] = sector;
        self.position += record + padding;
        Ok(())
    }

    /// Aborts after `cause`, keeping the cleanup error too if there is one.
    fn fail(&mut self, cause: Error) -> Error {
        match self.discard() {
            Ok(()) => cause,
            Err(cleanup) => Error::Aborted {
                source: Box::new(cause),
                cleanup: Box::new(cleanup),
            },
        }
    }

    /// Closes the handle and removes the file.
    ///
    /// A failed sync is reported as the close error, since dropping a
    /// `File` discards errors. If the remove fails too, both are returned.
    fn discard(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        // Buffered bytes are about to be deleted; only the handle matters.
        let (file, _) = file.into_parts();
        let closed = file.sync_all().map_err(|e| Error::io(e, &self.path));
        drop(file);

        let removed = fs::remove_file(&self.path).map_err(|e| Error::io(e, &self.path));
        match (closed, removed) {
            (Ok(()), Ok(())) => {
                info!("aborted {}", self.path.display());
                Ok(())
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(close), Err(remove)) => Err(Error::Aborted {
                source: Box::new(close),
                cleanup: Box::new(remove),
            }),
        }
    }
}

/// Reads until `buf` is full or the input ends, returning the bytes read.
fn read_grain<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn is_zeroed(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use tempfile::tempdir;

    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk went away"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0xA5);
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_compress_grain_is_zlib() {
        let data = vec![7u8; GRAIN_SIZE_BYTES as usize];
        let mut out = Vec::new();
        compress_grain(&data, Compression::default(), &mut out).unwrap();
        assert_eq!(out[0], 0x78);

        let mut inflated = Vec::new();
        ZlibDecoder::new(&out[..]).read_to_end(&mut inflated).unwrap();
        assert_eq!(inflated, data);
    }

    #[test]
    fn test_compression_levels() {
        assert_eq!(CompressionLevel::default(), CompressionLevel::Balanced);
        assert_eq!(CompressionLevel::Fast.level(), 1);
        assert_eq!(CompressionLevel::Max.level(), 9);
        assert_eq!(Compression::from(CompressionLevel::Balanced).level(), 6);
    }

    #[test]
    fn test_read_grain_short_input() {
        let mut buf = [0u8; 16];
        let n = read_grain(&mut &[1u8, 2, 3][..], &mut buf).unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_is_zeroed() {
        assert!(is_zeroed(&[0; 64]));
        assert!(!is_zeroed(&[0, 0, 1, 0]));
    }

    #[test]
    fn test_layout_for_ten_mb() {
        let dir = tempdir().unwrap();
        let writer = StreamOptimizedWriter::create(&dir.path().join("d.vmdk"), 10_485_760).unwrap();
        assert_eq!(writer.grain_count(), 160);
        assert_eq!(writer.grain_directory(), &[22]);
        assert_eq!(writer.header().overhead, 26);
        assert_eq!(writer.header().gd_offset, 21);
        writer.abort().unwrap();
    }

    #[test]
    fn test_grain_offsets_are_sector_aligned() {
        let dir = tempdir().unwrap();
        let mut writer =
            StreamOptimizedWriter::create(&dir.path().join("d.vmdk"), 4 * GRAIN_SIZE_BYTES).unwrap();

        let data: Vec<u8> = (0..4 * GRAIN_SIZE_BYTES).map(|i| (i % 251) as u8 + 1).collect();
        writer.write(&data[..]).unwrap();

        let table = writer.grain_table().to_vec();
        assert_eq!(table[0], writer.header().overhead);
        assert!(table.windows(2).all(|w| w[0] < w[1]));
        writer.close().unwrap();
    }

    #[test]
    fn test_read_error_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.vmdk");
        let mut writer = StreamOptimizedWriter::create(&path, 4 * GRAIN_SIZE_BYTES).unwrap();

        let reader = FailingReader {
            remaining: GRAIN_SIZE_BYTES as usize + 100,
        };
        let err = writer.write(reader).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!path.exists());
        assert!(writer.close().is_err());
    }

    #[test]
    fn test_abort_reports_remove_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.vmdk");
        let writer = StreamOptimizedWriter::create(&path, GRAIN_SIZE_BYTES).unwrap();
        fs::remove_file(&path).unwrap();

        match writer.abort().unwrap_err() {
            Error::Io { path: Some(p), .. } => assert_eq!(p, path),
            other => panic!("expected I/O error, got {other}"),
        }
    }

    #[test]
    fn test_failed_write_keeps_cleanup_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.vmdk");
        let mut writer = StreamOptimizedWriter::create(&path, 4 * GRAIN_SIZE_BYTES).unwrap();
        fs::remove_file(&path).unwrap();

        let reader = FailingReader { remaining: 0 };
        match writer.write(reader).unwrap_err() {
            Error::Aborted { source, cleanup } => {
                assert!(matches!(*source, Error::Io { path: None, .. }));
                assert!(matches!(*cleanup, Error::Io { path: Some(_), .. }));
            }
            other => panic!("expected aborted error, got {other}"),
        }
    }

    #[test]
    fn test_cancel_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.vmdk");
        let token = CancelToken::new();
        let options = WriterOptions::fast().with_cancel_token(token.clone());
        let mut writer =
            StreamOptimizedWriter::create_with_options(&path, GRAIN_SIZE_BYTES, options).unwrap();

        token.cancel();
        let err = writer.write(io::repeat(1)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!path.exists());
    }
}
