//! The completion marker written into a staging directory once every entry is
//! on disk.

use crate::error::{ErrorKind, Result};
use comicup_archive::validate_entry_path;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// File name of the completion marker inside a staging directory.
pub const MARKER_FILE: &str = ".comicup-staged.json";
const MARKER_PARTIAL: &str = ".comicup-staged.json.partial";
const MANIFEST_VERSION: u32 = 1;

/// Identity of the source archive at the time it was staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
}
impl SourceFingerprint {
    pub(crate) async fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path).await?;
        Ok(Self { size: metadata.len(), modified: metadata.modified()?.into() })
    }
}

/// A staged archive entry, in archive order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the archive root
    pub path: PathBuf,
    /// Size in bytes when staged
    pub size: u64,
    /// BLAKE3 hash of the content when staged
    pub hash: String,
}
impl ManifestEntry {
    pub fn new(path: impl Into<PathBuf>, data: &[u8]) -> Self {
        Self { path: path.into(), size: data.len() as u64, hash: blake3::hash(data).to_string() }
    }

    /// Whether `data` is exactly what was staged for this entry.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size && blake3::hash(data).to_string() == self.hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    version: u32,
    /// Absolute path of the source archive
    pub source: PathBuf,
    #[serde(flatten)]
    pub fingerprint: SourceFingerprint,
    #[serde(with = "time::serde::rfc3339")]
    pub staged_at: OffsetDateTime,
    pub entries: Vec<ManifestEntry>,
}
impl Manifest {
    pub fn new(source: impl Into<PathBuf>, fingerprint: SourceFingerprint, entries: Vec<ManifestEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            source: source.into(),
            fingerprint,
            staged_at: OffsetDateTime::now_utc(),
            entries,
        }
    }

    /// Parse a marker file's content. Returns `None` for anything that is not
    /// a manifest this version wrote, including entry paths that would
    /// resolve outside the staging directory.
    pub(crate) fn parse(bytes: &[u8]) -> Option<Self> {
        let manifest: Self = serde_json::from_slice(bytes).ok()?;
        if manifest.version != MANIFEST_VERSION {
            return None;
        }
        let safe = manifest
            .entries
            .iter()
            .all(|entry| validate_entry_path(&entry.path).is_ok_and(|validated| validated == entry.path));
        safe.then_some(manifest)
    }

    pub fn entry(&self, path: &Path) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    /// Write the marker into `directory` via a temporary file and a rename,
    /// so a marker is either absent or complete.
    pub(crate) async fn write_atomic(&self, directory: &Path) -> Result<()> {
        let marker = directory.join(MARKER_FILE);
        let json = serde_json::to_vec_pretty(self).or_raise(|| ErrorKind::Manifest(marker.clone()))?;
        let partial = directory.join(MARKER_PARTIAL);
        let mut file = fs::File::create(&partial).await.or_raise(|| ErrorKind::Io)?;
        file.write_all(&json).await.or_raise(|| ErrorKind::Io)?;
        file.sync_all().await.or_raise(|| ErrorKind::Io)?;
        drop(file);
        fs::rename(&partial, &marker).await.or_raise(|| ErrorKind::Io)?;
        Ok(())
    }
}
