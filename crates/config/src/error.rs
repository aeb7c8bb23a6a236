//! Configuration Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Every configuration error is fatal to the run: fix the configuration and
/// start again.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An explicitly requested configuration file does not exist.
    #[display("configuration file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// The configuration file extension is not toml, yaml or json.
    #[display("unsupported configuration file: {}", _0.display())]
    UnsupportedFile(#[error(not(source))] PathBuf),
    /// A configuration source could not be parsed into a configuration.
    #[display("invalid configuration")]
    Invalid,
    /// A configuration value is outside its allowed range.
    #[display("invalid configuration value for `{key}`: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
