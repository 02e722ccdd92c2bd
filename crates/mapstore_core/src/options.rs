//! Store configuration.

use mapstore_storage::{OpenMode, MIN_SEGMENT_SIZE};

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How to attach to the backing files.
    pub mode: OpenMode,

    /// Size the segment file is created at (or grown to, when larger than
    /// the current file). Ignored for read-only attaches.
    pub initial_size: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::ReadWrite,
            initial_size: MIN_SEGMENT_SIZE,
        }
    }
}

impl StoreOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attach mode.
    #[must_use]
    pub const fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the initial (or grown-to) segment size.
    #[must_use]
    pub const fn initial_size(mut self, size: u64) -> Self {
        self.initial_size = size;
        self
    }
}
