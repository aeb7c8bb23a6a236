use crate::error::{ErrorKind, Result};
use comicup_archive::{ArchiveFormat, KNOWN_EXTENSIONS};
use exn::ResultExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;

fn has_known_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| KNOWN_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.'))
}

/// The archives to process for `path`, in processing order.
///
/// A file is returned as-is, whatever its extension, so that an explicitly
/// named unsupported file is reported rather than silently ignored. A
/// directory is listed non-recursively: regular, non-hidden files with a
/// known archive extension, sorted by file name.
pub async fn discover(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(e).or_raise(|| ErrorKind::NotFound(path.to_path_buf()));
        },
        Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
    };
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut archives = Vec::new();
    let mut entries = fs::read_dir(path).await.or_raise(|| ErrorKind::Io)?;
    while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Io)? {
        let candidate = entry.path();
        if is_hidden(&candidate) || !has_known_extension(&candidate) {
            continue;
        }
        // Follows symlinks, unlike DirEntry::file_type.
        if fs::metadata(&candidate).await.is_ok_and(|m| m.is_file()) {
            archives.push(candidate);
        }
    }
    archives.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    tracing::debug!(directory = %path.display(), archives = archives.len(), "Discovered archives");
    Ok(archives)
}

/// Whether `archive` is itself the output of a previous run, recognised by
/// `suffix` in its file stem.
pub fn is_upscaled(archive: &Path, suffix: &str) -> bool {
    let marker = suffix.trim();
    archive.file_stem().and_then(|s| s.to_str()).is_some_and(|stem| !marker.is_empty() && stem.contains(marker))
}

/// Where the upscaled copy of `archive` is written: next to it, as
/// `<stem><suffix>.<extension>`.
///
/// Archives sharing a stem with another archive in the same directory would
/// all claim that name; use [`output_paths`] to name whole runs.
pub fn output_path(archive: &Path, suffix: &str, format: ArchiveFormat) -> PathBuf {
    let stem = archive.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    archive.with_file_name(format!("{stem}{suffix}.{}", format.extension()))
}

/// Output name that keeps the source extension, `<file name><suffix>.<extension>`,
/// for archives whose stem is not unique in their directory.
fn qualified_output_path(archive: &Path, suffix: &str, format: ArchiveFormat) -> PathBuf {
    let name = archive.file_name().map(|s| s.to_string_lossy()).unwrap_or_default();
    archive.with_file_name(format!("{name}{suffix}.{}", format.extension()))
}

fn stem_key(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_lowercase())
}

/// Stems shared by more than one archive in `directory`. Compared without
/// case, since output names collide on case-insensitive filesystems.
async fn shared_stems(directory: &Path) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut shared = HashSet::new();
    let Ok(mut entries) = fs::read_dir(directory).await else {
        return shared;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let candidate = entry.path();
        if is_hidden(&candidate) || !has_known_extension(&candidate) {
            continue;
        }
        if let Some(key) = stem_key(&candidate)
            && !seen.insert(key.clone())
        {
            shared.insert(key);
        }
    }
    shared
}

/// Output paths for `archives`, in the same order.
///
/// An archive gets [`output_path`] unless another archive in its directory
/// has the same stem (`a.cbt` next to `a.cbz`). Then every one of them keeps
/// its source extension in the output name, so each output belongs to
/// exactly one source whatever the processing order.
pub async fn output_paths(archives: &[PathBuf], suffix: &str, format: ArchiveFormat) -> Vec<PathBuf> {
    let mut shared = HashMap::new();
    let mut outputs = Vec::with_capacity(archives.len());
    for archive in archives {
        let directory = archive.parent().map(Path::to_path_buf).unwrap_or_default();
        if !shared.contains_key(&directory) {
            let listing = if directory.as_os_str().is_empty() {
                shared_stems(Path::new(".")).await
            } else {
                shared_stems(&directory).await
            };
            shared.insert(directory.clone(), listing);
        }
        let collides = stem_key(archive).is_some_and(|key| shared.get(&directory).is_some_and(|s| s.contains(&key)));
        if collides {
            tracing::debug!(archive = %archive.display(), "Archive stem is not unique; output keeps the source extension");
            outputs.push(qualified_output_path(archive, suffix, format));
        } else {
            outputs.push(output_path(archive, suffix, format));
        }
    }
    outputs
}
