//! Inference Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// An inference error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for inference operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device ran out of memory. Retry, ideally with a smaller batch.
    #[display("device out of memory")]
    OutOfMemory,
    /// The model rejected one of the tiles.
    #[display("unsupported input: {_0}")]
    UnsupportedInput(#[error(not(source))] String),
    /// The model cannot be used at all (missing executable, missing weights).
    #[display("upscaler unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The inference parameters are inconsistent.
    #[display("invalid inference parameters: {_0}")]
    InvalidParameters(#[error(not(source))] String),
    /// The external upscaler exited with a non-zero exit code. If there is no
    /// exit code it was killed by a signal, reported as `-1`.
    #[display("upscaler exited with code: {_0}")]
    Failed(#[error(not(source))] i32),
    /// The upscaler returned the wrong number of tiles, or tiles of the wrong
    /// size.
    #[display("malformed upscaler output: {_0}")]
    MalformedOutput(#[error(not(source))] String),
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::Failed(_) | Self::Io)
    }
}
