//! Comic book archive containers with format detection.
//!
//! This crate wraps the container libraries behind a unified
//! [`ArchiveFormat`] enum, providing:
//!
//! - **Format detection** from file extensions ([`ArchiveFormat::from_path`])
//!   or magic bytes ([`ArchiveFormat::from_magic_bytes`])
//! - **Reading** an archive into its ordered sequence of [`Page`]s
//!   ([`ArchiveFormat::open`])
//! - **Atomic writing** of a new archive ([`ArchiveFormat::write`]): the
//!   archive is built in a hidden temporary file next to the destination and
//!   renamed into place only once it is complete
//!
//! ZIP (`.cbz`) and TAR (`.cbt`) are always available. RAR (`.cbr`) can only
//! be read, and only with the `rar` feature enabled.

mod construct;
pub mod error;
mod ops;
mod path;
mod util;

pub use crate::path::validate as validate_entry_path;
use std::path::PathBuf;

/// File extensions recognised as comic archives, whether or not the formats
/// behind them are enabled.
pub const KNOWN_EXTENSIONS: [&str; 3] = ["cbz", "cbt", "cbr"];

/// A supported comic archive container.
///
/// Variants gated behind feature flags (`rar`) are only available when the
/// corresponding feature is enabled. Defaults to [`Cbz`](Self::Cbz).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ArchiveFormat {
    /// ZIP container (.cbz)
    #[default]
    Cbz,
    /// TAR container (.cbt)
    Cbt,
    /// RAR container (.cbr), read-only
    #[cfg(feature = "rar")]
    Cbr,
}

/// Compression applied to entries when writing a ZIP container.
///
/// Page images are almost always compressed already, so the default is to
/// store them as-is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntryCompression {
    /// Stored without compression
    #[default]
    None,
    Deflate,
    Bzip2,
    Zstd,
}

/// A single entry of an archive: its path relative to the archive root and
/// its raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub path: PathBuf,
    pub data: Vec<u8>,
}
impl Page {
    pub fn new(path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        Self { path: path.into(), data: data.into() }
    }
}
