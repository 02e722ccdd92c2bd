//! File mapping helpers.
//!
//! Wraps `memmap2` with the open/create/grow rules of the segment manager:
//! a read-write attach may create or grow the backing file (never shrink),
//! a read-only attach requires the file to exist and never writes.

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// How a store attaches to its backing files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Attach for reading only. The files must already exist.
    ReadOnly,
    /// Attach for reading and writing, creating or growing files as needed.
    ReadWrite,
}

impl OpenMode {
    /// Returns true for [`OpenMode::ReadWrite`].
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, OpenMode::ReadWrite)
    }
}

/// A view over a mapped file, mutable only for read-write attaches.
#[derive(Debug)]
enum MapView {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A memory-mapped file together with its open handle.
///
/// For read-write attaches the handle also carries the exclusive advisory
/// file lock that arbitrates single-writer access (held until drop).
#[derive(Debug)]
pub struct MappedFile {
    /// Kept open for the lifetime of the mapping; carries the advisory
    /// lock for read-write attaches.
    _file: File,
    view: MapView,
    mode: OpenMode,
}

impl MappedFile {
    /// Opens `path` read-write, creating it at `size` bytes if missing or
    /// growing it if `size` exceeds the current file size.
    ///
    /// Takes the exclusive advisory lock on the file; if another process
    /// (or handle) already holds it, fails with `AlreadyInUse`.
    pub fn open_read_write(path: &Path, size: u64, lock: bool) -> StorageResult<Self> {
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if lock && file.try_lock_exclusive().is_err() {
            return Err(StorageError::AlreadyInUse);
        }

        let current = file.metadata()?.len();
        if size > current {
            file.set_len(size)
                .map_err(|_| StorageError::GrowFailed { requested: size })?;
            debug!(path = %path.display(), from = current, to = size, "grew mapped file");
        } else if !existed && size == 0 {
            return Err(StorageError::GrowFailed { requested: 0 });
        }

        // Safety: the file stays open for the lifetime of the mapping and is
        // only resized through `grow`, which remaps first. Concurrent
        // processes are serialized by the advisory lock and the lock bank.
        let map = unsafe { MmapMut::map_mut(&file) }?;

        Ok(Self {
            _file: file,
            view: MapView::ReadWrite(map),
            mode: OpenMode::ReadWrite,
        })
    }

    /// Opens `path` read-only. The file must exist.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            return Err(StorageError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let file = OpenOptions::new().read(true).open(path)?;

        // Safety: see `open_read_write`; the read-only view never writes.
        let map = unsafe { Mmap::map(&file) }?;

        Ok(Self {
            _file: file,
            view: MapView::ReadOnly(map),
            mode: OpenMode::ReadOnly,
        })
    }

    /// Returns the attach mode.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Returns the mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match &self.view {
            MapView::ReadOnly(m) => m.len() as u64,
            MapView::ReadWrite(m) => m.len() as u64,
        }
    }

    /// Returns true if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.view {
            MapView::ReadOnly(m) => m,
            MapView::ReadWrite(m) => m,
        }
    }

    /// Returns the mapped bytes mutably; fails on a read-only attach.
    pub fn as_mut_slice(&mut self) -> StorageResult<&mut [u8]> {
        match &mut self.view {
            MapView::ReadOnly(_) => Err(StorageError::ReadOnly),
            MapView::ReadWrite(m) => Ok(&mut m[..]),
        }
    }

    /// Flushes dirty pages back to the file.
    pub fn flush(&self) -> StorageResult<()> {
        if let MapView::ReadWrite(m) = &self.view {
            m.flush()?;
        }
        Ok(())
    }
}
