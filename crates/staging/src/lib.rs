//! Per-archive staging directories.
//!
//! Every archive being processed is extracted into its own directory under a
//! staging root. A directory only counts as staged once its completion marker
//! ([`MARKER_FILE`]) has been written, which happens after every entry is on
//! disk. A directory without a valid marker, or whose entries no longer match
//! the marker, is evidence of an interrupted run: it is discarded and the
//! archive is extracted again from scratch.

pub mod error;
mod handle;
mod manifest;

use crate::error::{ErrorKind, Result};
use crate::handle::PAGES_DIR;
pub use crate::handle::{Outcome, StagingHandle};
pub use crate::manifest::{MARKER_FILE, Manifest, ManifestEntry, SourceFingerprint};
use comicup_archive::ArchiveFormat;
use derive_more::Display;
use exn::ResultExt;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::instrument;

const DIGEST_CHARS: usize = 16;

/// What a previous run left behind in an archive's staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingState {
    /// No staging directory exists.
    Absent,
    /// The directory is fully populated and matches its source archive.
    Complete(Manifest),
    /// The directory exists but cannot be trusted.
    Incomplete(IncompleteReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum IncompleteReason {
    #[display("completion marker missing")]
    MissingMarker,
    #[display("completion marker unreadable")]
    UnreadableMarker,
    #[display("source archive changed since it was staged")]
    SourceChanged,
    #[display("staged entry missing: {}", _0.display())]
    EntryMissing(PathBuf),
    #[display("staged entry modified: {}", _0.display())]
    EntryMismatch(PathBuf),
}

/// The root directory under which archives are staged.
#[derive(Clone, Debug)]
pub struct StagingArea {
    root: PathBuf,
}
impl StagingArea {
    /// Use `root` as the staging root, creating it if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = std::path::absolute(root.as_ref()).or_raise(|| ErrorKind::Io)?;
        // Use non-async here; it happens once at startup.
        std::fs::create_dir_all(&root).or_raise(|| ErrorKind::Io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The staging directory for an archive: `<stem>-<digest>`, where the
    /// digest is derived from the archive's absolute path so same-named
    /// archives in different directories never share a staging directory.
    pub fn directory_for(&self, archive: impl AsRef<Path>) -> Result<PathBuf> {
        let archive = std::path::absolute(archive.as_ref()).or_raise(|| ErrorKind::Io)?;
        let stem = archive.file_stem().map(|s| s.to_string_lossy()).unwrap_or(Cow::Borrowed("archive"));
        let digest = blake3::hash(archive.as_os_str().as_encoded_bytes()).to_hex();
        Ok(self.root.join(format!("{stem}-{}", &digest.as_str()[..DIGEST_CHARS])))
    }

    /// Classify whatever a previous run left in the archive's staging
    /// directory, without modifying it.
    #[instrument(skip_all, fields(archive = %archive.as_ref().display()))]
    pub async fn inspect(&self, archive: impl AsRef<Path>) -> Result<StagingState> {
        let source = std::path::absolute(archive.as_ref()).or_raise(|| ErrorKind::Io)?;
        inspect_directory(&self.directory_for(&source)?, &source).await
    }

    /// Acquire the staging directory for `archive`.
    ///
    /// A completely staged directory left by a previous run is reused as-is.
    /// An incomplete one is deleted and the archive is extracted again; on any
    /// extraction failure the directory is removed before returning.
    #[instrument(skip_all, fields(archive = %archive.as_ref().display()))]
    pub async fn acquire(&self, archive: impl AsRef<Path>) -> Result<StagingHandle> {
        let source = std::path::absolute(archive.as_ref()).or_raise(|| ErrorKind::Io)?;
        let directory = self.directory_for(&source)?;
        match inspect_directory(&directory, &source).await? {
            StagingState::Complete(manifest) => {
                tracing::info!(
                    staging = %directory.display(),
                    entries = manifest.entries.len(),
                    "Reusing completed staging area"
                );
                return Ok(StagingHandle::new(directory, manifest, true));
            },
            StagingState::Incomplete(reason) => {
                tracing::warn!(staging = %directory.display(), %reason, "Discarding incomplete staging area");
                fs::remove_dir_all(&directory).await.or_raise(|| ErrorKind::Io)?;
            },
            StagingState::Absent => {},
        }
        match populate(&directory, &source).await {
            Ok(manifest) => {
                tracing::debug!(staging = %directory.display(), entries = manifest.entries.len(), "Archive staged");
                Ok(StagingHandle::new(directory, manifest, false))
            },
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&directory).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(staging = %directory.display(), error = %cleanup, "Failed to remove staging area");
                }
                Err(e)
            },
        }
    }
}

async fn inspect_directory(directory: &Path, source: &Path) -> Result<StagingState> {
    if !fs::try_exists(directory).await.or_raise(|| ErrorKind::Io)? {
        return Ok(StagingState::Absent);
    }
    let marker = match fs::read(directory.join(MARKER_FILE)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StagingState::Incomplete(IncompleteReason::MissingMarker));
        },
        Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
    };
    let Some(manifest) = Manifest::parse(&marker) else {
        return Ok(StagingState::Incomplete(IncompleteReason::UnreadableMarker));
    };
    let unchanged = match SourceFingerprint::of(source).await {
        Ok(fingerprint) => manifest.source == source && manifest.fingerprint == fingerprint,
        Err(_) => false,
    };
    if !unchanged {
        return Ok(StagingState::Incomplete(IncompleteReason::SourceChanged));
    }
    let pages = directory.join(PAGES_DIR);
    for entry in &manifest.entries {
        match fs::read(pages.join(&entry.path)).await {
            Ok(data) if entry.matches(&data) => {},
            Ok(_) => return Ok(StagingState::Incomplete(IncompleteReason::EntryMismatch(entry.path.clone()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StagingState::Incomplete(IncompleteReason::EntryMissing(entry.path.clone())));
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
        }
    }
    Ok(StagingState::Complete(manifest))
}

async fn populate(directory: &Path, source: &Path) -> Result<Manifest> {
    let fingerprint = SourceFingerprint::of(source).await.or_raise(|| ErrorKind::Io)?;
    let archive = source.to_path_buf();
    let pages = tokio::task::spawn_blocking(move || ArchiveFormat::open(archive))
        .await
        .or_raise(|| ErrorKind::Io)?
        .map_err(ErrorKind::archive)?;

    let pages_dir = directory.join(PAGES_DIR);
    fs::create_dir_all(&pages_dir).await.or_raise(|| ErrorKind::Io)?;
    let mut entries = Vec::with_capacity(pages.len());
    for page in pages {
        let target = pages_dir.join(&page.path);
        // Entries differing only by case collide on case-insensitive filesystems.
        if fs::try_exists(&target).await.or_raise(|| ErrorKind::Io)? {
            let reason = format!("entry collides on disk: {}", page.path.display());
            exn::bail!(ErrorKind::Archive(comicup_archive::error::ErrorKind::CorruptArchive(reason)));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
        }
        fs::write(&target, &page.data).await.or_raise(|| ErrorKind::Io)?;
        entries.push(ManifestEntry::new(page.path, &page.data));
    }
    let manifest = Manifest::new(source, fingerprint, entries);
    manifest.write_atomic(directory).await?;
    Ok(manifest)
}
