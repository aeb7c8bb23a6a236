use crate::error::{ErrorKind, Result};
use crate::manifest::{Manifest, ManifestEntry};
use comicup_archive::{Page, validate_entry_path};
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::instrument;

/// Sub-directory of a staging directory holding the extracted entries.
pub(crate) const PAGES_DIR: &str = "pages";

/// How processing of a staged archive ended. Recorded in the logs when the
/// staging area is released; the directory is removed in every case.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Outcome {
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
}

/// Exclusive access to one archive's staging directory.
///
/// Call [`release`](Self::release) when done. A handle dropped without being
/// released still removes its directory, but only on a best-effort basis
/// from a synchronous context.
#[derive(Debug)]
pub struct StagingHandle {
    directory: PathBuf,
    manifest: Manifest,
    reused: bool,
    released: bool,
}
impl StagingHandle {
    pub(crate) fn new(directory: PathBuf, manifest: Manifest, reused: bool) -> Self {
        Self { directory, manifest, reused, released: false }
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Staged entries, in archive order.
    #[inline]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.manifest.entries
    }

    /// Whether a complete staging directory from a previous run was reused
    /// instead of extracting the archive again.
    #[inline]
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    fn entry_path(&self, entry: &Path) -> Result<PathBuf> {
        let validated = validate_entry_path(entry).map_err(|e| e.raise(ErrorKind::UnknownEntry(entry.to_path_buf())))?;
        self.manifest.entry(&validated).ok_or_raise(|| ErrorKind::UnknownEntry(entry.to_path_buf()))?;
        Ok(self.directory.join(PAGES_DIR).join(validated))
    }

    /// Read the current content of a staged entry.
    pub async fn read(&self, entry: &Path) -> Result<Vec<u8>> {
        let path = self.entry_path(entry)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(e).or_raise(|| ErrorKind::Incomplete(self.directory.clone()))
            },
            Err(e) => Err(e).or_raise(|| ErrorKind::Io),
        }
    }

    /// Atomically replace a staged entry with new content, keeping its path
    /// and position in the archive.
    ///
    /// The completion marker keeps the hash of the originally staged content,
    /// so a staging directory with replaced entries is never mistaken for a
    /// fresh extraction by a later run.
    #[instrument(skip(self, data), fields(staging = %self.directory.display(), entry = %entry.display(), size = data.len()))]
    pub async fn replace(&self, entry: &Path, data: &[u8]) -> Result<()> {
        let path = self.entry_path(entry)?;
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let partial = path.with_file_name(format!(".{file_name}.partial"));
        fs::write(&partial, data).await.or_raise(|| ErrorKind::Io)?;
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e).or_raise(|| ErrorKind::Io);
        }
        Ok(())
    }

    /// Read every staged entry back, in archive order, ready to be packed
    /// into a new archive.
    pub async fn pages(&self) -> Result<Vec<Page>> {
        let mut pages = Vec::with_capacity(self.manifest.entries.len());
        for entry in &self.manifest.entries {
            pages.push(Page::new(entry.path.clone(), self.read(&entry.path).await?));
        }
        Ok(pages)
    }

    /// Remove the staging directory. Failure to remove is logged, never
    /// returned: a leftover directory is detected and discarded by the next
    /// run.
    #[instrument(skip(self), fields(staging = %self.directory.display()))]
    pub async fn release(mut self, outcome: Outcome) {
        self.released = true;
        match fs::remove_dir_all(&self.directory).await {
            Ok(()) => tracing::debug!("Staging area released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => tracing::warn!(error = %e, "Failed to remove staging area"),
        }
    }
}

impl Drop for StagingHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(staging = %self.directory.display(), "Staging area dropped without release; removing it");
        if let Err(e) = std::fs::remove_dir_all(&self.directory)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(staging = %self.directory.display(), error = %e, "Failed to remove staging area");
        }
    }
}
