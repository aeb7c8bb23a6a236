use derive_more::Display;
use std::path::{Path, PathBuf};

/// Where an archive is in its lifecycle.
///
/// Archives move forward one state at a time and may fail from any state
/// that is not terminal.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ArchiveState {
    #[display("discovered")]
    Discovered,
    /// Extracted into a staging directory.
    #[display("staged")]
    Staged,
    /// Pages decoded and cut into tiles.
    #[display("planned")]
    Planned,
    /// Tiles queued for or awaiting inference.
    #[display("inferring")]
    Inferring,
    /// Every page reassembled and re-encoded into the staging directory.
    #[display("recomposed")]
    Recomposed,
    /// Output archive written.
    #[display("repacked")]
    Repacked,
    #[display("done")]
    Done,
    #[display("failed")]
    Failed,
}

impl ArchiveState {
    /// The state following this one on the success path.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Discovered => Some(Self::Staged),
            Self::Staged => Some(Self::Planned),
            Self::Planned => Some(Self::Inferring),
            Self::Inferring => Some(Self::Recomposed),
            Self::Recomposed => Some(Self::Repacked),
            Self::Repacked => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_become(self, to: Self) -> bool {
        match to {
            Self::Failed => !self.is_terminal(),
            to => self.next() == Some(to),
        }
    }
}

/// Tracks one archive's state and logs every transition.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    archive: PathBuf,
    state: ArchiveState,
}
impl Lifecycle {
    pub(crate) fn new(archive: impl Into<PathBuf>) -> Self {
        Self { archive: archive.into(), state: ArchiveState::Discovered }
    }

    pub(crate) fn archive(&self) -> &Path {
        &self.archive
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ArchiveState {
        self.state
    }

    /// Move to `to`. Invalid transitions are logged and ignored.
    pub(crate) fn advance(&mut self, to: ArchiveState) {
        if !self.state.can_become(to) {
            tracing::error!(archive = %self.archive.display(), from = %self.state, %to, "Invalid archive state transition");
            return;
        }
        tracing::debug!(archive = %self.archive.display(), from = %self.state, %to, "Archive state changed");
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_success_path() {
        let mut lifecycle = Lifecycle::new("book.cbz");
        let mut visited = vec![lifecycle.state()];
        while let Some(next) = lifecycle.state().next() {
            lifecycle.advance(next);
            visited.push(lifecycle.state());
        }
        assert_eq!(
            visited,
            [
                ArchiveState::Discovered,
                ArchiveState::Staged,
                ArchiveState::Planned,
                ArchiveState::Inferring,
                ArchiveState::Recomposed,
                ArchiveState::Repacked,
                ArchiveState::Done
            ]
        );
    }

    #[rstest]
    #[case(ArchiveState::Discovered, ArchiveState::Failed, true)]
    #[case(ArchiveState::Inferring, ArchiveState::Failed, true)]
    #[case(ArchiveState::Done, ArchiveState::Failed, false)]
    #[case(ArchiveState::Failed, ArchiveState::Failed, false)]
    #[case(ArchiveState::Staged, ArchiveState::Inferring, false)]
    #[case(ArchiveState::Planned, ArchiveState::Staged, false)]
    fn test_transitions(#[case] from: ArchiveState, #[case] to: ArchiveState, #[case] allowed: bool) {
        assert_eq!(from.can_become(to), allowed);
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let mut lifecycle = Lifecycle::new("book.cbz");
        lifecycle.advance(ArchiveState::Repacked);
        assert_eq!(lifecycle.state(), ArchiveState::Discovered);
        lifecycle.advance(ArchiveState::Failed);
        lifecycle.advance(ArchiveState::Staged);
        assert_eq!(lifecycle.state(), ArchiveState::Failed);
    }
}
