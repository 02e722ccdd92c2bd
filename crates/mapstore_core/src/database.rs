//! The static database facade.

use crate::error::{StoreError, StoreResult};
use crate::index::TypedIndex;
use crate::object::{IndexKey, StoreObject};
use crate::options::StoreOptions;
use crate::session::{Session, SessionHost};
use crate::types::ObjectId;
use mapstore_storage::{LockBank, OpenMode, Segment};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Type-erased view of a registered typed index, for fan-out operations.
trait AnyIndex: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn start_undo(&mut self, revision: u64);
    fn has_undo_state(&self) -> bool;
    fn undo_depth(&self) -> usize;
    fn undo(&mut self, segment: &mut Segment) -> StoreResult<()>;
    fn squash(&mut self);
    fn commit(&mut self, revision: u64);
}

impl<T: StoreObject> AnyIndex for TypedIndex<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn start_undo(&mut self, revision: u64) {
        TypedIndex::start_undo(self, revision);
    }

    fn has_undo_state(&self) -> bool {
        TypedIndex::has_undo_state(self)
    }

    fn undo_depth(&self) -> usize {
        TypedIndex::undo_depth(self)
    }

    fn undo(&mut self, segment: &mut Segment) -> StoreResult<()> {
        TypedIndex::undo(self, segment)
    }

    fn squash(&mut self) {
        TypedIndex::squash(self);
    }

    fn commit(&mut self, revision: u64) {
        TypedIndex::commit(self, revision);
    }
}

struct Inner {
    dir: PathBuf,
    segment: Option<Segment>,
    indices: HashMap<u16, Box<dyn AnyIndex>>,
    revision: u64,
}

/// An object store of statically registered typed indices backed by a
/// memory-mapped file.
///
/// All mutations route through the active undo session (when one exists),
/// so any sequence of creates, modifies and removes can be reverted until
/// its revision is committed away.
///
/// A handle is not meant for concurrent mutation from several threads;
/// either give each thread its own handle or serialize access externally.
/// Cross-process coordination goes through [`Database::with_read_lock`] /
/// [`Database::with_write_lock`].
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::open(dir, OpenMode::ReadWrite, 8 << 20)?;
/// db.add_index::<Book>()?;
///
/// let book = db.create::<Book>(|b| {
///     b.a = 3;
///     b.b = 4;
/// })?;
///
/// {
///     let _session = db.start_undo_session(true)?;
///     db.modify(&book, |b| b.a = 7)?;
///     // dropped without push(): the modify is reverted
/// }
/// assert_eq!(db.get::<Book>(book.object_id())?.a, 3);
/// ```
pub struct Database {
    locks: LockBank,
    inner: Mutex<Inner>,
}

impl Database {
    /// Opens the store under `dir`, attaching the segment and lock bank.
    ///
    /// See [`Segment::open`] for create/grow rules. `size` is ignored on a
    /// read-only attach.
    pub fn open(dir: &Path, mode: OpenMode, size: u64) -> StoreResult<Self> {
        let segment = Segment::open(dir, mode, size)?;
        let locks = LockBank::open(&Segment::meta_path(dir))?;
        let revision = segment.revision()?;
        info!(dir = %dir.display(), ?mode, revision, "opened database");
        Ok(Self {
            locks,
            inner: Mutex::new(Inner {
                dir: dir.to_path_buf(),
                segment: Some(segment),
                indices: HashMap::new(),
                revision,
            }),
        })
    }

    /// Opens the store with explicit [`StoreOptions`].
    pub fn open_with_options(dir: &Path, options: &StoreOptions) -> StoreResult<Self> {
        Self::open(dir, options.mode, options.initial_size)
    }

    /// Registers the typed index for `T`, materializing it in the segment
    /// if absent (read-write) or requiring it to exist (read-only).
    pub fn add_index<T: StoreObject>(&self) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.indices.contains_key(&T::TYPE_TAG) {
            return Err(StoreError::AlreadyRegistered {
                name: T::TYPE_NAME,
            });
        }
        if Self::session_depth(inner) != 0 {
            return Err(StoreError::invalid_operation(
                "cannot register an index while an undo session is active",
            ));
        }
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        let index = TypedIndex::<T>::open(segment)?;
        inner.indices.insert(T::TYPE_TAG, Box::new(index));
        debug!(index = T::TYPE_NAME, tag = T::TYPE_TAG, "registered index");
        Ok(())
    }

    /// Creates a new object of type `T`, returning the inserted value.
    pub fn create<T: StoreObject>(&self, init: impl FnOnce(&mut T)) -> StoreResult<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (segment, index) = Self::writable_index::<T>(inner)?;
        index.create(segment, init)
    }

    /// Mutates `obj` in place under the active undo session.
    pub fn modify<T: StoreObject>(
        &self,
        obj: &T,
        mutate: impl FnOnce(&mut T),
    ) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (segment, index) = Self::writable_index::<T>(inner)?;
        index.modify(segment, obj.object_id(), mutate)
    }

    /// Removes `obj` from its index and every ordering.
    pub fn remove<T: StoreObject>(&self, obj: &T) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (segment, index) = Self::writable_index::<T>(inner)?;
        index.remove(segment, obj.object_id())
    }

    /// Looks up an object by id, failing with `OutOfRange` on a miss.
    pub fn get<T: StoreObject>(&self, id: ObjectId) -> StoreResult<T> {
        let guard = self.inner.lock();
        Ok(Self::index::<T>(&guard)?.get(id)?.clone())
    }

    /// Looks up an object by id.
    pub fn find<T: StoreObject>(&self, id: ObjectId) -> StoreResult<Option<T>> {
        let guard = self.inner.lock();
        Ok(Self::index::<T>(&guard)?.find(id).cloned())
    }

    /// Looks up an object through a named secondary ordering, failing on a
    /// miss.
    pub fn get_by<T: StoreObject>(&self, key_name: &str, key: &IndexKey) -> StoreResult<T> {
        let guard = self.inner.lock();
        Ok(Self::index::<T>(&guard)?.get_by(key_name, key)?.clone())
    }

    /// Looks up an object through a named secondary ordering.
    pub fn find_by<T: StoreObject>(
        &self,
        key_name: &str,
        key: &IndexKey,
    ) -> StoreResult<Option<T>> {
        let guard = self.inner.lock();
        Ok(Self::index::<T>(&guard)?.find_by(key_name, key).cloned())
    }

    /// Returns every object of type `T` in id order.
    pub fn scan<T: StoreObject>(&self) -> StoreResult<Vec<T>> {
        let guard = self.inner.lock();
        Ok(Self::index::<T>(&guard)?.iter().cloned().collect())
    }

    /// Number of objects in the index for `T`.
    pub fn len<T: StoreObject>(&self) -> StoreResult<usize> {
        let guard = self.inner.lock();
        Ok(Self::index::<T>(&guard)?.len())
    }

    // ---- sessions ---------------------------------------------------------

    /// Begins an undo session over every registered index.
    ///
    /// With `enabled = false` the returned handle is inert: mutations made
    /// under it are permanent immediately.
    pub fn start_undo_session(&self, enabled: bool) -> StoreResult<Session<'_>> {
        if !enabled {
            return Ok(Session::disabled(self));
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        if !segment.is_writable() {
            return Err(StoreError::NotWritable);
        }
        inner.revision += 1;
        segment.set_revision(inner.revision)?;
        for index in inner.indices.values_mut() {
            index.start_undo(inner.revision);
        }
        debug!(revision = inner.revision, "started undo session");
        Ok(Session::new(self, inner.revision))
    }

    /// Reverts the most recent still-reversible session on every index.
    pub fn undo(&self) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        let mut reverted = false;
        for index in inner.indices.values_mut() {
            if index.has_undo_state() {
                index.undo(segment)?;
                reverted = true;
            }
        }
        if reverted {
            inner.revision -= 1;
            segment.set_revision(inner.revision)?;
            debug!(revision = inner.revision, "undid session");
        }
        Ok(())
    }

    /// Reverts every still-reversible session.
    pub fn undo_all(&self) -> StoreResult<()> {
        while self.has_undo_session() {
            self.undo()?;
        }
        Ok(())
    }

    /// Discards every undo state with revision `<= revision`; those
    /// mutations are no longer reversible.
    pub fn commit(&self, revision: u64) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.segment.as_ref().ok_or(StoreError::Closed)?;
        for index in inner.indices.values_mut() {
            index.commit(revision);
        }
        debug!(revision, "committed");
        Ok(())
    }

    /// Current revision counter.
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// True while at least one undo state remains on some index.
    pub fn has_undo_session(&self) -> bool {
        self.inner
            .lock()
            .indices
            .values()
            .any(|index| index.has_undo_state())
    }

    // ---- locking ----------------------------------------------------------

    /// Runs `f` while holding the current bank lock in shared mode.
    pub fn with_read_lock<R>(&self, f: impl FnOnce() -> R, wait: Duration) -> StoreResult<R> {
        Ok(self.locks.with_read_lock(f, wait)?)
    }

    /// Runs `f` while holding the current bank lock in exclusive mode; the
    /// bank cursor advances afterwards.
    pub fn with_write_lock<R>(&self, f: impl FnOnce() -> R, wait: Duration) -> StoreResult<R> {
        Ok(self.locks.with_write_lock(f, wait)?)
    }

    /// Reads the bank cursor.
    pub fn current_lock(&self) -> u32 {
        self.locks.current_lock()
    }

    // ---- lifecycle --------------------------------------------------------

    /// Releases the mapping and the exclusive file lock. Later operations
    /// on this handle fail with `Closed`.
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        if let Some(segment) = guard.segment.take() {
            if let Err(error) = segment.flush() {
                tracing::warn!(%error, "flush on close failed");
            }
        }
        guard.indices.clear();
        info!(dir = %guard.dir.display(), "closed database");
    }

    /// Closes the store and deletes both backing files.
    pub fn wipe(self) -> StoreResult<()> {
        self.close();
        let dir = self.inner.lock().dir.clone();
        for path in [Segment::bin_path(&dir), Segment::meta_path(&dir)] {
            if path.exists() {
                fs::remove_file(&path).map_err(mapstore_storage::StorageError::from)?;
            }
        }
        info!(dir = %dir.display(), "wiped database");
        Ok(())
    }

    // ---- helpers ----------------------------------------------------------

    fn session_depth(inner: &Inner) -> usize {
        inner
            .indices
            .values()
            .map(|index| index.undo_depth())
            .max()
            .unwrap_or(0)
    }

    fn writable_index<'a, T: StoreObject>(
        inner: &'a mut Inner,
    ) -> StoreResult<(&'a mut Segment, &'a mut TypedIndex<T>)> {
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        if !segment.is_writable() {
            return Err(StoreError::NotWritable);
        }
        let index = inner
            .indices
            .get_mut(&T::TYPE_TAG)
            .ok_or_else(|| StoreError::invalid_operation(format!(
                "index {} is not registered",
                T::TYPE_NAME
            )))?
            .as_any_mut()
            .downcast_mut::<TypedIndex<T>>()
            .expect("type tag maps to exactly one index type");
        Ok((segment, index))
    }

    fn index<'a, T: StoreObject>(inner: &'a Inner) -> StoreResult<&'a TypedIndex<T>> {
        inner.segment.as_ref().ok_or(StoreError::Closed)?;
        inner
            .indices
            .get(&T::TYPE_TAG)
            .ok_or_else(|| StoreError::invalid_operation(format!(
                "index {} is not registered",
                T::TYPE_NAME
            )))?
            .as_any()
            .downcast_ref::<TypedIndex<T>>()
            .ok_or_else(|| StoreError::invalid_operation("type tag collision"))
    }
}

impl SessionHost for Database {
    fn session_undo(&self) -> StoreResult<()> {
        self.undo()
    }

    fn session_squash(&self) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        for index in inner.indices.values_mut() {
            index.squash();
        }
        inner.revision -= 1;
        segment.set_revision(inner.revision)?;
        Ok(())
    }
}
