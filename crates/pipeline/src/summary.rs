use crate::error::FailureKind;
use derive_more::Display;
use std::fmt::{Display as FmtDisplay, Formatter, Result as FmtResult};
use std::path::PathBuf;

/// Why an archive was not processed.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum SkipReason {
    /// The archive is itself the output of a previous run.
    #[display("already upscaled")]
    AlreadyUpscaled,
    /// A completed output archive already exists.
    #[display("output exists: {}", _0.display())]
    OutputExists(PathBuf),
}

/// One page that could not be upscaled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageFailure {
    /// Path of the page inside the archive.
    pub page: PathBuf,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
    /// Every page that failed; empty when the archive failed as a whole.
    pub pages: Vec<PageFailure>,
}
impl Failure {
    pub(crate) fn new(kind: FailureKind, reason: impl FmtDisplay) -> Self {
        Self { kind, reason: reason.to_string(), pages: Vec::new() }
    }

    pub(crate) fn from_pages(pages: Vec<PageFailure>, total: usize) -> Self {
        let kind = pages.first().map(|p| p.kind).unwrap_or(FailureKind::Image);
        let reason = format!("{} of {total} pages failed", pages.len());
        Self { kind, reason, pages }
    }
}
impl FmtDisplay for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}: {}", self.kind, self.reason)?;
        for page in &self.pages {
            write!(f, "; {}: {}: {}", page.page.display(), page.kind, page.reason)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveStatus {
    Processed {
        output: PathBuf,
        /// Number of image pages upscaled.
        pages: usize,
    },
    Skipped(SkipReason),
    Failed(Failure),
    /// Stopped by a cancellation request before it finished.
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveResult {
    pub archive: PathBuf,
    pub status: ArchiveStatus,
}

/// Outcome of a run, with archives listed in discovery order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub results: Vec<ArchiveResult>,
}
impl Summary {
    fn count(&self, predicate: impl Fn(&ArchiveStatus) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.status)).count()
    }

    pub fn processed_count(&self) -> usize {
        self.count(|s| matches!(s, ArchiveStatus::Processed { .. }))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|s| matches!(s, ArchiveStatus::Skipped(_)))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|s| matches!(s, ArchiveStatus::Failed(_)))
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(|s| matches!(s, ArchiveStatus::Cancelled))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&PathBuf, &Failure)> {
        self.results.iter().filter_map(|r| match &r.status {
            ArchiveStatus::Failed(failure) => Some((&r.archive, failure)),
            _ => None,
        })
    }

    /// Process exit code: `1` when archives failed and none was processed,
    /// `0` otherwise. Skipped and cancelled archives are not progress, so
    /// failures next to skips alone still exit `1`. A run that only skipped
    /// archives succeeded.
    pub fn exit_code(&self) -> u8 {
        if self.failed_count() > 0 && self.processed_count() == 0 { 1 } else { 0 }
    }
}
impl FmtDisplay for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "processed {}, skipped {}, failed {}, cancelled {}",
            self.processed_count(),
            self.skipped_count(),
            self.failed_count(),
            self.cancelled_count()
        )
    }
}
