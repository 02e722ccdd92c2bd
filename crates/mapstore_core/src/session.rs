//! Scoped undo sessions.

use crate::error::StoreResult;
use tracing::warn;

/// Fan-out target of a session: the static database or the dynamic shell.
pub(crate) trait SessionHost {
    /// Reverts the most recent session on every index.
    fn session_undo(&self) -> StoreResult<()>;
    /// Merges the most recent session into the one below it.
    fn session_squash(&self) -> StoreResult<()>;
}

/// A scoped handle for one frame on every registered index's undo stack.
///
/// Dropping an un-pushed session reverts everything it recorded, on every
/// exit path including unwinding. [`Session::push`] leaves the frame on the
/// stack, to be reverted later by `undo()` on the database or discarded by
/// `commit(revision)`.
///
/// Sessions are single-owner and must be ended innermost-first.
pub struct Session<'a> {
    host: &'a dyn SessionHost,
    revision: u64,
    enabled: bool,
    done: bool,
}

impl<'a> Session<'a> {
    pub(crate) fn new(host: &'a dyn SessionHost, revision: u64) -> Self {
        Self {
            host,
            revision,
            enabled: true,
            done: false,
        }
    }

    pub(crate) fn disabled(host: &'a dyn SessionHost) -> Self {
        Self {
            host,
            revision: 0,
            enabled: false,
            done: true,
        }
    }

    /// Revision assigned to this session's undo states (0 when disabled).
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True when the session actually records undo state.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Defers finalization: the undo frame stays on the stack instead of
    /// being reverted when the handle drops.
    pub fn push(mut self) {
        self.done = true;
    }

    /// Explicitly reverts this session's work now.
    pub fn undo(mut self) -> StoreResult<()> {
        if !self.enabled || self.done {
            return Ok(());
        }
        self.done = true;
        self.host.session_undo()
    }

    /// Merges this session's frame into its parent's.
    pub fn squash(mut self) -> StoreResult<()> {
        if !self.enabled || self.done {
            return Ok(());
        }
        self.done = true;
        self.host.session_squash()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.enabled && !self.done {
            if let Err(error) = self.host.session_undo() {
                warn!(%error, revision = self.revision, "undo on session drop failed");
            }
        }
    }
}
