//! Entry path validation.
//!
//! Entry names inside an archive are untrusted input. Before anything is
//! extracted they are normalised into a relative path that cannot leave the
//! extraction root.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};

/// Validates and normalises an archive entry path.
///
/// `.` components and repeated separators are dropped, `..` is resolved
/// against the preceding components and rejected if it would climb out of
/// the archive root. Absolute paths have their root stripped and are treated
/// as relative. Windows prefixes and NUL bytes are rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use comicup_archive::validate_entry_path;
/// assert_eq!(validate_entry_path("ch01/./001.jpg").unwrap(), Path::new("ch01/001.jpg"));
/// assert!(validate_entry_path("../../etc/passwd").is_err());
/// assert!(validate_entry_path("a\0b.png").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let unsafe_path = || ErrorKind::CorruptArchive(format!("unsafe entry path: {}", path.display()));
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(unsafe_path());
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(unsafe_path()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(unsafe_path());
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(unsafe_path()),
        false => Ok(components.into_iter().collect()),
    }
}

/// ZIP entry names written by Windows tools sometimes use backslashes as
/// separators, which Unix paths would read as part of a single file name.
pub(crate) fn normalize_separators(name: &str) -> String {
    name.replace('\\', "/")
}
