//! Error types for the vmdkstream core library.

use std::path::PathBuf;

/// The main error type for VMDK codec operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The file is not a stream-optimized sparse VMDK.
    #[error("invalid VMDK format (must be streamOptimized): {message}")]
    InvalidFormat { message: String },

    /// Error building or laying out a VMDK file.
    #[error("VMDK error: {message}")]
    Vmdk { message: String },

    /// Error compressing grain data.
    #[error("failed to compress grain {grain}: {source}")]
    Compression {
        grain: u64,
        source: std::io::Error,
    },

    /// The write was cancelled through its cancellation token.
    #[error("write cancelled")]
    Cancelled,

    /// A failure whose cleanup also failed; both errors are kept.
    #[error("{source} (cleanup also failed: {cleanup})")]
    Aborted {
        source: Box<Error>,
        cleanup: Box<Error>,
    },
}

/// A specialized Result type for VMDK codec operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Create a VMDK error.
    pub fn vmdk(message: impl Into<String>) -> Self {
        Self::Vmdk {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by a file that is not stream-optimized.
    pub fn is_invalid_format(&self) -> bool {
        match self {
            Self::InvalidFormat { .. } => true,
            Self::Aborted { source, .. } => source.is_invalid_format(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/disk.vmdk");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/disk.vmdk"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
    }

    #[test]
    fn test_invalid_format_error() {
        let err = Error::invalid_format("bad magic number 0x00000000");
        assert!(err.is_invalid_format());
        assert!(err.to_string().contains("streamOptimized"));
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_vmdk_error() {
        let err = Error::vmdk("descriptor too large");
        assert!(err.to_string().contains("VMDK error"));
        assert!(!err.is_invalid_format());
    }

    #[test]
    fn test_aborted_keeps_both_errors() {
        let err = Error::Aborted {
            source: Box::new(Error::vmdk("write failed")),
            cleanup: Box::new(Error::io_simple(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "remove denied",
            ))),
        };
        let msg = err.to_string();
        assert!(msg.contains("write failed"));
        assert!(msg.contains("remove denied"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
