//! Inter-process read/write lock bank.
//!
//! A bank of [`NUM_RW_LOCKS`] read/write locks plus a shared cursor, stored
//! in the `shared_memory.meta` mapping so every attached process sees the
//! same state. The meta file is separate from the main segment so that a
//! crash while writing the segment cannot corrupt lock words.
//!
//! Each lock is a single `AtomicU32`: bit 31 is the writer flag, the low
//! bits count readers. Acquisition spins with a short sleep until the
//! deadline passes, then fails with `LockTimeout`. The cursor rotates to
//! the next lock after every *successful* write acquisition, which biases
//! new writers away from a lock currently pinned by a long-running reader.

use crate::error::{StorageError, StorageResult};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Number of read/write locks in the bank.
pub const NUM_RW_LOCKS: u32 = 10;

const META_MAGIC: u32 = 0x4D53_4C4B; // "MSLK"
const META_VERSION: u32 = 1;

const WORD_MAGIC: usize = 0;
const WORD_VERSION: usize = 1;
const WORD_CURSOR: usize = 2;
const WORD_LOCKS: usize = 4;

const WRITER_BIT: u32 = 1 << 31;
const READER_MASK: u32 = WRITER_BIT - 1;

/// Meta file size. Only the first few words are used; the rest is headroom
/// for layout growth without remapping peers.
const META_LEN: u64 = 4096;

const SPIN_SLEEP: Duration = Duration::from_micros(50);

/// The bank of inter-process read/write locks backed by the meta mapping.
#[derive(Debug)]
pub struct LockBank {
    map: MmapMut,
}

impl LockBank {
    /// Opens (creating if missing) the meta mapping at `path`.
    ///
    /// The mapping is always writable: readers mutate reader counts even on
    /// a read-only store attach.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < META_LEN {
            file.set_len(META_LEN)
                .map_err(|_| StorageError::GrowFailed {
                    requested: META_LEN,
                })?;
        }

        // Safety: the file stays open for the lifetime of the mapping.
        let map = unsafe { MmapMut::map_mut(&file) }?;
        let bank = Self { map };

        // First attacher initializes; the CAS keeps a concurrent second
        // attacher from re-zeroing live state.
        let words = bank.words();
        if words[WORD_MAGIC]
            .compare_exchange(0, META_MAGIC, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            words[WORD_VERSION].store(META_VERSION, Ordering::Release);
            debug!(path = %path.display(), "initialized lock bank");
        } else if words[WORD_MAGIC].load(Ordering::Acquire) != META_MAGIC {
            return Err(StorageError::HeaderCorrupted(
                "meta mapping has unknown magic".into(),
            ));
        }

        Ok(bank)
    }

    /// Views the mapping as a word array shared with other processes.
    ///
    /// Atomics are the only sound way to touch memory that other processes
    /// mutate concurrently; every access below goes through this view.
    fn words(&self) -> &[AtomicU32] {
        let ptr = self.map.as_ptr();
        assert!(ptr as usize % 4 == 0, "unaligned mmap address");
        let count = self.map.len() / 4;
        // Safety:
        // * mmap returns valid memory for self.map.len() bytes
        // * the memory is aliased across processes, which is why all access
        //   is through atomics (external interior mutability)
        // * alignment checked above
        // * the view borrows self, so it cannot outlive the mapping
        unsafe { &*std::ptr::slice_from_raw_parts(ptr.cast::<AtomicU32>(), count) }
    }

    fn lock_word(&self, index: u32) -> &AtomicU32 {
        &self.words()[WORD_LOCKS + index as usize]
    }

    /// Returns the current position of the lock cursor.
    #[must_use]
    pub fn current_lock(&self) -> u32 {
        self.words()[WORD_CURSOR].load(Ordering::Acquire) % NUM_RW_LOCKS
    }

    fn advance_cursor(&self) {
        let words = self.words();
        let cur = words[WORD_CURSOR].load(Ordering::Acquire);
        words[WORD_CURSOR].store((cur + 1) % NUM_RW_LOCKS, Ordering::Release);
    }

    /// Runs `f` while holding the current lock in shared mode.
    ///
    /// Fails with `LockTimeout` when the lock cannot be acquired within
    /// `wait`. The lock is released on every exit path, including panics.
    pub fn with_read_lock<R>(&self, f: impl FnOnce() -> R, wait: Duration) -> StorageResult<R> {
        let index = self.current_lock();
        let guard = self.acquire(index, false, wait)?;
        let result = f();
        drop(guard);
        Ok(result)
    }

    /// Runs `f` while holding the current lock in exclusive mode, then
    /// advances the cursor before releasing.
    pub fn with_write_lock<R>(&self, f: impl FnOnce() -> R, wait: Duration) -> StorageResult<R> {
        let index = self.current_lock();
        let guard = self.acquire(index, true, wait)?;
        let result = f();
        self.advance_cursor();
        drop(guard);
        Ok(result)
    }

    fn acquire(&self, index: u32, exclusive: bool, wait: Duration) -> StorageResult<LockGuard<'_>> {
        let word = self.lock_word(index);
        let deadline = Instant::now() + wait;
        loop {
            let state = word.load(Ordering::Acquire);
            let attempt = if exclusive {
                (state == 0).then_some(WRITER_BIT)
            } else {
                (state & WRITER_BIT == 0 && state & READER_MASK < READER_MASK)
                    .then_some(state + 1)
            };
            if let Some(next) = attempt {
                if word
                    .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(LockGuard { word, exclusive });
                }
                continue;
            }
            if Instant::now() >= deadline {
                warn!(lock = index, exclusive, "lock acquisition timed out");
                return Err(StorageError::LockTimeout { lock: index });
            }
            std::thread::sleep(SPIN_SLEEP);
        }
    }
}

/// Releases a held lock on drop, so panics inside the closure unlock too.
struct LockGuard<'a> {
    word: &'a AtomicU32,
    exclusive: bool,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.exclusive {
            self.word.store(0, Ordering::Release);
        } else {
            self.word.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_bank(dir: &Path) -> LockBank {
        LockBank::open(&dir.join("shared_memory.meta")).unwrap()
    }

    const WAIT: Duration = Duration::from_millis(200);

    #[test]
    fn read_lock_does_not_advance_cursor() {
        let temp = tempdir().unwrap();
        let bank = open_bank(temp.path());

        assert_eq!(bank.current_lock(), 0);
        bank.with_read_lock(|| (), WAIT).unwrap();
        bank.with_read_lock(|| (), WAIT).unwrap();
        assert_eq!(bank.current_lock(), 0);
    }

    #[test]
    fn write_lock_advances_cursor_by_one_modulo_bank_size() {
        let temp = tempdir().unwrap();
        let bank = open_bank(temp.path());

        for i in 0..NUM_RW_LOCKS {
            let observed = bank.with_write_lock(|| bank.current_lock(), WAIT).unwrap();
            assert_eq!(observed, i % NUM_RW_LOCKS);
        }
        // A full cycle wraps back to the start.
        assert_eq!(bank.current_lock(), 0);
    }

    #[test]
    fn cursor_is_shared_between_handles() {
        let temp = tempdir().unwrap();
        let a = open_bank(temp.path());
        let b = open_bank(temp.path());

        a.with_write_lock(|| (), WAIT).unwrap();
        a.with_write_lock(|| (), WAIT).unwrap();
        assert_eq!(b.current_lock(), 2);
    }

    #[test]
    fn readers_are_shared() {
        let temp = tempdir().unwrap();
        let bank = open_bank(temp.path());

        bank.with_read_lock(
            || {
                // A second reader on the same lock succeeds while the first
                // is still inside its closure.
                bank.with_read_lock(|| (), WAIT).unwrap();
            },
            WAIT,
        )
        .unwrap();
    }

    #[test]
    fn writer_excludes_reader_until_timeout() {
        let temp = tempdir().unwrap();
        let bank = open_bank(temp.path());

        let result = bank.with_write_lock(
            || bank.with_read_lock(|| (), Duration::from_millis(20)),
            WAIT,
        );
        assert!(matches!(
            result,
            Ok(Err(StorageError::LockTimeout { .. }))
        ));
    }

    #[test]
    fn lock_is_released_after_closure() {
        let temp = tempdir().unwrap();
        let bank = open_bank(temp.path());

        bank.with_write_lock(|| (), WAIT).unwrap();
        // Cursor moved to 1; lock 0 must be free again for the next cycle.
        for _ in 0..NUM_RW_LOCKS {
            bank.with_write_lock(|| (), WAIT).unwrap();
        }
    }
}
