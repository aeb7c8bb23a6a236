//! Pipeline Error Types
//!
//! Two layers: [`ErrorKind`] is for the few errors that end the whole run,
//! [`FailureKind`] classifies everything that only fails one archive or page
//! and ends up in the [`Summary`](crate::Summary).

use comicup_archive::error::ErrorKind as ArchiveErrorKind;
use comicup_staging::error::ErrorKind as StagingErrorKind;
use derive_more::{Display, Error};
use std::path::PathBuf;

/// A run-level error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for run-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop the run before any archive is processed.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration is inconsistent, or the upscaler rejects it.
    #[display("invalid configuration: {_0}")]
    Configuration(#[error(not(source))] String),
    /// The staging root could not be created.
    #[display("cannot prepare staging root: {}", _0.display())]
    Staging(#[error(not(source))] PathBuf),
    /// The input path does not exist.
    #[display("path not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// The input directory could not be listed.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io)
    }
}

/// Why an archive (or one of its pages) could not be upscaled.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum FailureKind {
    #[display("unsupported format")]
    UnsupportedFormat,
    #[display("corrupt archive")]
    CorruptArchive,
    /// The staging directory could not be populated or kept consistent.
    #[display("staging")]
    Staging,
    /// An image could not be decoded or re-encoded.
    #[display("image")]
    Image,
    #[display("tiling")]
    Tiling,
    #[display("inference")]
    Inference,
    #[display("I/O")]
    Io,
}

impl FailureKind {
    pub(crate) fn of_archive(kind: &ArchiveErrorKind) -> Self {
        match kind {
            ArchiveErrorKind::UnsupportedFormat(_) | ArchiveErrorKind::DisabledFormat(_) => Self::UnsupportedFormat,
            ArchiveErrorKind::CorruptArchive(_) => Self::CorruptArchive,
            ArchiveErrorKind::AlreadyExists(_) | ArchiveErrorKind::Io => Self::Io,
        }
    }

    pub(crate) fn of_staging(kind: &StagingErrorKind) -> Self {
        match kind {
            StagingErrorKind::Archive(kind) => Self::of_archive(kind),
            StagingErrorKind::Incomplete(_) | StagingErrorKind::Manifest(_) | StagingErrorKind::UnknownEntry(_) => {
                Self::Staging
            },
            StagingErrorKind::Io => Self::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ArchiveErrorKind::UnsupportedFormat("pdf".to_string()), FailureKind::UnsupportedFormat)]
    #[case(ArchiveErrorKind::DisabledFormat("cbr".to_string()), FailureKind::UnsupportedFormat)]
    #[case(ArchiveErrorKind::CorruptArchive("bad".to_string()), FailureKind::CorruptArchive)]
    #[case(ArchiveErrorKind::Io, FailureKind::Io)]
    fn test_archive_failures(#[case] kind: ArchiveErrorKind, #[case] expected: FailureKind) {
        assert_eq!(FailureKind::of_archive(&kind), expected);
        assert_eq!(FailureKind::of_staging(&StagingErrorKind::Archive(kind)), expected);
    }

    #[test]
    fn test_staging_failures() {
        assert_eq!(FailureKind::of_staging(&StagingErrorKind::Incomplete(PathBuf::from("x"))), FailureKind::Staging);
        assert_eq!(FailureKind::of_staging(&StagingErrorKind::Io), FailureKind::Io);
    }
}
