//! Archive Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The container format is not one of the supported formats. Skip the
    /// archive and report it.
    #[display("unsupported format: {_0}")]
    UnsupportedFormat(#[error(not(source))] String),
    /// The container format is supported but was not enabled at compile time.
    #[display("disabled format: {_0}")]
    DisabledFormat(#[error(not(source))] String),
    /// The container could not be parsed, or it contains entries that cannot
    /// be extracted safely. Don't retry with the same input.
    #[display("corrupt archive: {_0}")]
    CorruptArchive(#[error(not(source))] String),
    /// A completed archive already exists at the destination.
    #[display("archive already exists: {}", _0.display())]
    AlreadyExists(#[error(not(source))] PathBuf),
    /// An I/O operation on the filesystem failed.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exn::ResultExt;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::UnsupportedFormat("cb7".to_string()).to_string(), "unsupported format: cb7");
        assert_eq!(ErrorKind::CorruptArchive("bad header".to_string()).to_string(), "corrupt archive: bad header");
        assert_eq!(
            ErrorKind::AlreadyExists(PathBuf::from("out/book.cbz")).to_string(),
            "archive already exists: out/book.cbz"
        );
        assert_eq!(ErrorKind::Io.to_string(), "I/O error");
    }

    #[test]
    fn error_kind_retryable() {
        assert!(!ErrorKind::CorruptArchive(String::new()).is_retryable());
        assert!(!ErrorKind::UnsupportedFormat("cb7".to_string()).is_retryable());
        assert!(ErrorKind::Io.is_retryable());
    }

    #[test]
    fn error_from_result() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));
        let err: Result<()> = result.or_raise(|| ErrorKind::Io);
        let exn = err.unwrap_err();
        assert_eq!(*exn, ErrorKind::Io);
    }
}
