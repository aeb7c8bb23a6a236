//! Staging Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use comicup_archive::error::{Error as ArchiveError, ErrorKind as ArchiveErrorKind};
use derive_more::{Display, Error};
use std::path::PathBuf;

/// A staging error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for staging operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The source archive could not be read while populating the staging area.
    #[display("archive error: {_0}")]
    Archive(ArchiveErrorKind),
    /// The staging directory lost files after it was acquired. Re-stage it
    /// from scratch.
    #[display("incomplete staging area: {}", _0.display())]
    Incomplete(#[error(not(source))] PathBuf),
    /// The completion marker could not be serialised.
    #[display("invalid staging manifest: {}", _0.display())]
    Manifest(#[error(not(source))] PathBuf),
    /// The entry is not part of the staged archive.
    #[display("entry not staged: {}", _0.display())]
    UnknownEntry(#[error(not(source))] PathBuf),
    /// An I/O operation on the staging directory failed.
    #[display("I/O error")]
    Io,
}
impl ErrorKind {
    /// Convert an archive error into a staging error, preserving the archive
    /// crate's `Exn` frame (error tree) as a child in its own error tree.
    #[track_caller]
    pub fn archive(err: ArchiveError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Archive(inner))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Archive(kind) => kind.is_retryable(),
            Self::Incomplete(_) | Self::Io => true,
            Self::Manifest(_) | Self::UnknownEntry(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_errors_keep_their_kind() {
        let err = ErrorKind::archive(exn::Exn::from(ArchiveErrorKind::CorruptArchive("bad".to_string())));
        assert_eq!(*err, ErrorKind::Archive(ArchiveErrorKind::CorruptArchive("bad".to_string())));
        assert!(!err.is_retryable());
        assert!(ErrorKind::archive(exn::Exn::from(ArchiveErrorKind::Io)).is_retryable());
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::Incomplete(PathBuf::from("/tmp/a-0")).to_string(), "incomplete staging area: /tmp/a-0");
        assert_eq!(
            ErrorKind::Archive(ArchiveErrorKind::UnsupportedFormat("pdf".to_string())).to_string(),
            "archive error: unsupported format: pdf"
        );
    }
}
