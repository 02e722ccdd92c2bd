//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur at the mapping / segment / lock-bank layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing file or directory does not exist and the open mode does
    /// not permit creating it.
    #[error("database file not found at {path}")]
    NotFound {
        /// The path that was looked up.
        path: PathBuf,
    },

    /// The segment was created by a different build, compiler or platform.
    #[error("database created by a different build or platform")]
    IncompatibleBuild,

    /// The segment header failed its checksum; the file layout cannot be
    /// trusted.
    #[error("segment header corrupted: {0}")]
    HeaderCorrupted(String),

    /// The backing file could not be grown to the requested size.
    #[error("could not grow database file to {requested} bytes")]
    GrowFailed {
        /// The requested file size.
        requested: u64,
    },

    /// The in-segment allocator ran out of space.
    #[error("segment full: cannot allocate {requested} bytes")]
    SegmentFull {
        /// The requested allocation size.
        requested: u64,
    },

    /// Another process holds write access to the shared memory file.
    #[error("could not gain write access to the shared memory file")]
    AlreadyInUse,

    /// A lock in the bank could not be acquired within the deadline.
    #[error("timed out waiting for lock {lock}")]
    LockTimeout {
        /// The lock index that timed out.
        lock: u32,
    },

    /// A mutation was attempted through a read-only attach.
    #[error("segment is attached read-only")]
    ReadOnly,

    /// The fixed index-slot directory has no vacant slot left.
    #[error("index slot directory full ({max} slots)")]
    DirectoryFull {
        /// The directory capacity.
        max: usize,
    },
}
