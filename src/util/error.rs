//! Error types for the UVF library.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for container, brick and cache operations.
#[derive(Error, Debug)]
pub enum Error {
    /// File does not exist or cannot be accessed
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// File is shorter than the smallest valid container
    #[error("File too small to be a UVF container ({0} bytes)")]
    FileTooSmall(u64),

    /// Invalid magic bytes at start of file
    #[error("Invalid UVF file: expected UVF-DATA magic bytes")]
    InvalidMagic,

    /// File written by a newer writer than this reader understands
    #[error("Unsupported UVF version {found} (reader version is {supported})")]
    UnsupportedVersion { found: u64, supported: u64 },

    /// Invalid data structure in file
    #[error("Invalid file structure: {0}")]
    InvalidStructure(String),

    /// Stored and computed checksums differ in length
    #[error("Checksum length mismatch: stored {stored} bytes, computed {computed} bytes")]
    ChecksumLengthMismatch { stored: usize, computed: usize },

    /// Stored and computed checksums differ in value
    #[error("Checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    /// Payload could not be inflated or deflated
    #[error("Compression error: {0}")]
    Compression(String),

    /// A block or configuration failed its consistency check
    #[error("Validation failed: {0}")]
    Validation(String),

    /// LOD or brick coordinate outside the raster
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Feature or data layout this build cannot handle
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Brick cache cannot free enough memory for a new texture
    #[error("Brick cache exhausted: need {requested} bytes, {available} bytes can be made available")]
    CacheExhausted { requested: u64, available: u64 },

    /// Texture handle unknown to the cache (released twice or invalidated)
    #[error("Invalid texture handle: {0}")]
    InvalidHandle(u64),

    /// Store or container is not writable (opened read-only)
    #[error("Container is read-only")]
    ReadOnly,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Broad error categories.
///
/// Lets callers tell bad data apart from a bad device or plain budget pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad magic, truncated file, checksum mismatch.
    Format,
    /// A block or setting failed `verify`.
    Validation,
    /// Out-of-range LOD or brick coordinate.
    Range,
    /// Cache budget pressure; recoverable by degrading.
    Resource,
    /// Underlying device or permission failure.
    Io,
    /// API misuse (stale handles, writes to read-only containers).
    Usage,
}

impl Error {
    /// Create an invalid structure error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidStructure(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an out-of-range error.
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileTooSmall(_)
            | Self::InvalidMagic
            | Self::UnsupportedVersion { .. }
            | Self::InvalidStructure(_)
            | Self::ChecksumLengthMismatch { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Compression(_) => ErrorKind::Format,
            Self::Validation(_) | Self::Unsupported(_) | Self::Json(_) => ErrorKind::Validation,
            Self::OutOfRange(_) => ErrorKind::Range,
            Self::CacheExhausted { .. } => ErrorKind::Resource,
            Self::FileNotFound(_) | Self::Io(_) => ErrorKind::Io,
            Self::InvalidHandle(_) | Self::ReadOnly => ErrorKind::Usage,
        }
    }

    /// True for soft failures a caller should degrade around.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Resource
    }
}

/// Result type alias for UVF operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = Error::CacheExhausted { requested: 4096, available: 1024 };
        assert!(e.to_string().contains("4096"));
        assert!(e.to_string().contains("1024"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_error_kinds_are_distinct() {
        assert_eq!(Error::InvalidMagic.kind(), ErrorKind::Format);
        assert_eq!(Error::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(Error::out_of_range("x").kind(), ErrorKind::Range);
        assert_eq!(Error::InvalidHandle(3).kind(), ErrorKind::Usage);
        assert!(Error::CacheExhausted { requested: 1, available: 0 }.is_recoverable());
        assert!(!Error::ChecksumMismatch { stored: "a".into(), computed: "b".into() }.is_recoverable());
    }
}
