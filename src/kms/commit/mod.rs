//! Translation of the pending model changes into driver calls

use drm::control::AtomicCommitFlags;
use tracing::{error, info_span, trace};

use super::{
    changes::{OutputChanges, PipeChanges, PlaneChanges},
    display::{Display, PlaneType},
    error::Error,
};

mod atomic;
mod legacy;

/// Protocol used to commit the model to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStyle {
    /// One ioctl per resource; the primary plane is programmed with a modeset and the
    /// cursor through the cursor ioctls
    Legacy,
    /// `SETPLANE` for every plane including primary and cursor, no modesets
    Universal,
    /// One atomic request allowing modesets
    Atomic,
}

impl Display {
    /// Commits all pending changes, failing on the first error
    ///
    /// The error is wrapped into [`Error::Commit`] and logged, since callers of this
    /// function expect the commit to work.
    pub fn commit2(&mut self, style: CommitStyle) -> Result<(), Error> {
        self.try_commit2(style).map_err(|err| {
            error!(parent: &self.span, ?style, %err, "commit failed");
            Error::Commit {
                style,
                source: Box::new(err),
            }
        })
    }

    /// Commits all pending changes with [`CommitStyle::Legacy`]
    pub fn commit(&mut self) -> Result<(), Error> {
        self.commit2(CommitStyle::Legacy)
    }

    /// Commits all pending changes, returning the first error unchanged
    ///
    /// Programming stops at the first failing call. Changes that already reached the
    /// driver are not rolled back and the change flags stay set, so the model and the
    /// hardware may disagree until the next successful commit.
    #[profiling::function]
    pub fn try_commit2(&mut self, style: CommitStyle) -> Result<(), Error> {
        let span = info_span!(parent: &self.span, "commit", ?style);
        let _guard = span.enter();

        self.refresh()?;
        match style {
            CommitStyle::Atomic => self.commit_atomic_request(AtomicCommitFlags::ALLOW_MODESET)?,
            CommitStyle::Legacy | CommitStyle::Universal => self.commit_legacy(style)?,
        }

        self.clear_changes(style);
        Ok(())
    }

    /// Commits all pending changes atomically with custom flags, failing on error
    pub fn commit_atomic(&mut self, flags: AtomicCommitFlags) -> Result<(), Error> {
        self.try_commit_atomic(flags).map_err(|err| {
            error!(parent: &self.span, ?flags, %err, "atomic commit failed");
            Error::Commit {
                style: CommitStyle::Atomic,
                source: Box::new(err),
            }
        })
    }

    /// Commits all pending changes atomically with custom flags
    ///
    /// With [`AtomicCommitFlags::TEST_ONLY`] the request is only validated and the change
    /// flags stay set. Completion events requested with
    /// [`AtomicCommitFlags::PAGE_FLIP_EVENT`] can be read with
    /// [`read_flip_event`](super::event::read_flip_event).
    #[profiling::function]
    pub fn try_commit_atomic(&mut self, flags: AtomicCommitFlags) -> Result<(), Error> {
        let span = info_span!(parent: &self.span, "commit", style = ?CommitStyle::Atomic, ?flags);
        let _guard = span.enter();

        self.refresh()?;
        self.commit_atomic_request(flags)?;
        if flags.contains(AtomicCommitFlags::TEST_ONLY) {
            return Ok(());
        }
        self.clear_changes(CommitStyle::Atomic);
        Ok(())
    }

    fn clear_changes(&mut self, style: CommitStyle) {
        trace!(?style, "clearing change flags");
        for pipe in &mut self.pipes {
            if style == CommitStyle::Atomic && pipe.changes.contains(PipeChanges::MODE) {
                pipe.enabled = self
                    .outputs
                    .iter()
                    .any(|output| output.pending_crtc_idx_mask == pipe.id.mask());
            }
            pipe.changes.remove(PipeChanges::BACKGROUND | PipeChanges::COLOR_MGMT);
            if style != CommitStyle::Universal {
                pipe.changes.remove(PipeChanges::MODE);
            }

            for plane in &mut pipe.planes {
                plane.changes.remove(PlaneChanges::SCANOUT);
                let keeps_rotation =
                    style == CommitStyle::Legacy && matches!(plane.kind, PlaneType::Primary | PlaneType::Cursor);
                if !keeps_rotation {
                    plane.changes.remove(PlaneChanges::ROTATION);
                }
            }
        }

        for output in &mut self.outputs {
            if style != CommitStyle::Universal {
                output.changes.remove(OutputChanges::PIPE);
            }
            if style == CommitStyle::Atomic {
                output.changes.remove(OutputChanges::SCALING_MODE);
            }
        }
    }
}
