//! The multi-database shell: the top-level facade of the dynamic variant.

use crate::dynamic::database::{DatabaseHandle, DynCell, DynDatabase, Table};
use crate::dynamic::index::DynamicIndex;
use crate::dynamic::record::Record;
use crate::error::{StoreError, StoreResult};
use crate::session::{Session, SessionHost};
use crate::types::RecordId;
use mapstore_storage::{LockBank, OpenMode, Segment, SlotId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Directory-slot tag reserved for the dynamic subsystem. Static type tags
/// are 16-bit, so this can never collide with one.
const DYNAMIC_ROOT_TAG: u32 = 0x0001_0000;

/// Owned description of a dynamic database, returned by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    /// The database name.
    pub name: String,
    /// Names of its tables, sorted.
    pub tables: Vec<String>,
}

struct MultiInner {
    dir: PathBuf,
    segment: Option<Segment>,
    slot: SlotId,
    databases: BTreeMap<String, DynDatabase>,
    revision: u64,
}

/// A collection of named dynamic databases in one mapped segment.
///
/// Same open/close/wipe/lock surface as the static
/// [`Database`](crate::Database), but tables and records are created at
/// runtime instead of being registered at compile time. Each database has
/// its own undo stack shared by all of its tables; sessions started on the
/// shell fan out across every database.
///
/// # Example
///
/// ```rust,ignore
/// let shell = MultiDatabase::open(dir, OpenMode::ReadWrite, 8 << 20)?;
/// shell.create_database("test")?;
/// shell.modify("test", |db| {
///     db.create_table("balances")?;
///     db.create("balances", 1, 2, b"abc".to_vec())?;
///     Ok(())
/// })?;
/// let record = shell.get_by_primary("test", "balances", 1)?;
/// ```
pub struct MultiDatabase {
    locks: LockBank,
    inner: Mutex<MultiInner>,
}

impl MultiDatabase {
    /// Opens the dynamic store under `dir`. See
    /// [`Segment::open`] for the create/grow rules.
    pub fn open(dir: &Path, mode: OpenMode, size: u64) -> StoreResult<Self> {
        let mut segment = Segment::open(dir, mode, size)?;
        let locks = LockBank::open(&Segment::meta_path(dir))?;

        let slot = if segment.is_writable() {
            segment.register_slot(DYNAMIC_ROOT_TAG)?
        } else {
            segment
                .find_slot(DYNAMIC_ROOT_TAG)
                .ok_or_else(|| StoreError::IndexNotFound {
                    name: "dynamic database index".to_string(),
                })?
        };

        let databases = Self::load(&segment, slot)?;
        let revision = segment.revision()?;
        info!(
            dir = %dir.display(),
            ?mode,
            databases = databases.len(),
            "opened multi database"
        );
        Ok(Self {
            locks,
            inner: Mutex::new(MultiInner {
                dir: dir.to_path_buf(),
                segment: Some(segment),
                slot,
                databases,
                revision,
            }),
        })
    }

    /// Rebuilds every database from the dynamic chain. Cells arrive in
    /// arbitrary order, so databases materialize first, then tables, then
    /// records.
    fn load(segment: &Segment, slot: SlotId) -> StoreResult<BTreeMap<String, DynDatabase>> {
        let cells = segment.chain_cells(slot)?;
        let mut databases = BTreeMap::new();
        let mut tables = Vec::new();
        let mut records = Vec::new();

        for (cell, payload) in cells {
            match bincode::deserialize::<DynCell>(&payload)? {
                DynCell::Database { name } => {
                    databases.insert(name.clone(), DynDatabase::new(name, cell));
                }
                DynCell::Table {
                    db,
                    name,
                    primary,
                    secondary,
                    next_id,
                } => tables.push((cell, db, name, primary, secondary, next_id)),
                DynCell::Record { db, table, record } => {
                    records.push((cell, db, table, record));
                }
            }
        }

        for (cell, db, name, primary, secondary, next_id) in tables {
            let database = databases.get_mut(&db).ok_or_else(|| {
                StoreError::invalid_operation(format!("table {name} references unknown database {db}"))
            })?;
            let mut index = DynamicIndex::new(primary, secondary);
            index.next_id = next_id;
            database.tables.insert(
                name.clone(),
                Table {
                    name,
                    meta_cell: cell,
                    index,
                },
            );
        }

        for (cell, db, table, record) in records {
            let database = databases.get_mut(&db).ok_or_else(|| {
                StoreError::invalid_operation(format!("record references unknown database {db}"))
            })?;
            let table = database.tables.get_mut(&table).ok_or_else(|| {
                StoreError::invalid_operation(format!("record references unknown table {table}"))
            })?;
            table.index.insert(record, cell)?;
        }

        Ok(databases)
    }

    // ---- database management ----------------------------------------------

    /// Creates a new named database.
    pub fn create_database(&self, name: &str) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        if !segment.is_writable() {
            return Err(StoreError::NotWritable);
        }
        if inner.databases.contains_key(name) {
            return Err(StoreError::AlreadyExists {
                kind: "database",
                name: name.to_string(),
            });
        }
        let payload = bincode::serialize(&DynCell::Database {
            name: name.to_string(),
        })?;
        let cell = segment.chain_push(inner.slot, &payload)?;
        inner
            .databases
            .insert(name.to_string(), DynDatabase::new(name.to_string(), cell));
        debug!(database = name, "created dynamic database");
        Ok(())
    }

    /// Describes a database, failing on a miss.
    pub fn get_database(&self, name: &str) -> StoreResult<DatabaseInfo> {
        self.find_database(name)?
            .ok_or_else(|| StoreError::DatabaseNotFound {
                name: name.to_string(),
            })
    }

    /// Describes a database.
    pub fn find_database(&self, name: &str) -> StoreResult<Option<DatabaseInfo>> {
        let guard = self.inner.lock();
        guard.segment.as_ref().ok_or(StoreError::Closed)?;
        Ok(guard.databases.get(name).map(|db| DatabaseInfo {
            name: db.name.clone(),
            tables: db.table_names(),
        }))
    }

    /// Names of all databases, sorted.
    pub fn database_names(&self) -> StoreResult<Vec<String>> {
        let guard = self.inner.lock();
        guard.segment.as_ref().ok_or(StoreError::Closed)?;
        Ok(guard.databases.keys().cloned().collect())
    }

    /// Removes a database and everything in it.
    pub fn remove_database(&self, name: &str) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        if !segment.is_writable() {
            return Err(StoreError::NotWritable);
        }
        let database = inner
            .databases
            .remove(name)
            .ok_or_else(|| StoreError::DatabaseNotFound {
                name: name.to_string(),
            })?;
        for cell in database.all_cells() {
            segment.chain_remove(inner.slot, cell)?;
        }
        debug!(database = name, "removed dynamic database");
        Ok(())
    }

    // ---- mutation and reads -----------------------------------------------

    /// Runs `f` with a mutation handle over the named database. Mutations
    /// are captured by the database's undo stack while a session is active.
    pub fn modify<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut DatabaseHandle<'_>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner.slot;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        if !segment.is_writable() {
            return Err(StoreError::NotWritable);
        }
        let db = inner
            .databases
            .get_mut(name)
            .ok_or_else(|| StoreError::DatabaseNotFound {
                name: name.to_string(),
            })?;
        let mut handle = DatabaseHandle { segment, slot, db };
        f(&mut handle)
    }

    /// Creates a record through the shell, without an explicit `modify`.
    pub fn create_record(
        &self,
        database: &str,
        table: &str,
        primary: i128,
        secondary: i128,
        value: impl Into<Vec<u8>>,
    ) -> StoreResult<Record> {
        let value = value.into();
        self.modify(database, |db| db.create(table, primary, secondary, value))
    }

    /// Looks up a record by id.
    pub fn find_by_id(
        &self,
        database: &str,
        table: &str,
        id: RecordId,
    ) -> StoreResult<Option<Record>> {
        self.with_database(database, |db| {
            Ok(db.find_record_by_id(table, id)?.cloned())
        })
    }

    /// Looks up a record by id, failing on a miss.
    pub fn get_by_id(&self, database: &str, table: &str, id: RecordId) -> StoreResult<Record> {
        self.find_by_id(database, table, id)?
            .ok_or_else(|| StoreError::RecordNotFound {
                key: "id",
                table: table.to_string(),
            })
    }

    /// Looks up the first record with this primary key.
    pub fn find_by_primary(
        &self,
        database: &str,
        table: &str,
        primary: i128,
    ) -> StoreResult<Option<Record>> {
        self.with_database(database, |db| {
            Ok(db.find_record_by_primary(table, primary)?.cloned())
        })
    }

    /// Looks up the first record with this primary key, failing on a miss.
    pub fn get_by_primary(
        &self,
        database: &str,
        table: &str,
        primary: i128,
    ) -> StoreResult<Record> {
        self.find_by_primary(database, table, primary)?
            .ok_or_else(|| StoreError::RecordNotFound {
                key: "primary",
                table: table.to_string(),
            })
    }

    /// Looks up the first record with this secondary key.
    pub fn find_by_secondary(
        &self,
        database: &str,
        table: &str,
        secondary: i128,
    ) -> StoreResult<Option<Record>> {
        self.with_database(database, |db| {
            Ok(db.find_record_by_secondary(table, secondary)?.cloned())
        })
    }

    /// Looks up the first record with this secondary key, failing on a miss.
    pub fn get_by_secondary(
        &self,
        database: &str,
        table: &str,
        secondary: i128,
    ) -> StoreResult<Record> {
        self.find_by_secondary(database, table, secondary)?
            .ok_or_else(|| StoreError::RecordNotFound {
                key: "secondary",
                table: table.to_string(),
            })
    }

    // ---- sessions ---------------------------------------------------------

    /// Begins an undo session over every database.
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
        for db in inner.databases.values_mut() {
            db.undo.start_undo(inner.revision);
        }
        debug!(revision = inner.revision, "started undo session");
        Ok(Session::new(self, inner.revision))
    }

    /// Reverts the most recent still-reversible session on every database.
    pub fn undo(&self) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner.slot;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        let mut reverted = false;
        for db in inner.databases.values_mut() {
            if db.undo.is_enabled() {
                db.undo(segment, slot)?;
                reverted = true;
            }
        }
        if reverted {
            inner.revision -= 1;
            segment.set_revision(inner.revision)?;
        }
        Ok(())
    }

    /// Reverts every still-reversible session.
    pub fn undo_all(&self) -> StoreResult<()> {
        loop {
            let any = self
                .inner
                .lock()
                .databases
                .values()
                .any(|db| db.undo.is_enabled());
            if !any {
                return Ok(());
            }
            self.undo()?;
        }
    }

    /// Discards every undo state with revision `<= revision`.
    pub fn commit(&self, revision: u64) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        guard.segment.as_ref().ok_or(StoreError::Closed)?;
        for db in guard.databases.values_mut() {
            db.undo.commit(revision);
        }
        Ok(())
    }

    /// Current revision counter.
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    // ---- locking ----------------------------------------------------------

    /// Runs `f` while holding the current bank lock in shared mode.
    pub fn with_read_lock<R>(&self, f: impl FnOnce() -> R, wait: Duration) -> StoreResult<R> {
        Ok(self.locks.with_read_lock(f, wait)?)
    }

    /// Runs `f` while holding the current bank lock in exclusive mode.
    pub fn with_write_lock<R>(&self, f: impl FnOnce() -> R, wait: Duration) -> StoreResult<R> {
        Ok(self.locks.with_write_lock(f, wait)?)
    }

    /// Reads the bank cursor.
    pub fn current_lock(&self) -> u32 {
        self.locks.current_lock()
    }

    // ---- lifecycle --------------------------------------------------------

    /// Releases the mapping and the exclusive file lock.
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        if let Some(segment) = guard.segment.take() {
            if let Err(error) = segment.flush() {
                tracing::warn!(%error, "flush on close failed");
            }
        }
        guard.databases.clear();
        info!(dir = %guard.dir.display(), "closed multi database");
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
        info!(dir = %dir.display(), "wiped multi database");
        Ok(())
    }

    // ---- helpers ----------------------------------------------------------

    fn with_database<R>(
        &self,
        name: &str,
        f: impl FnOnce(&DynDatabase) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let guard = self.inner.lock();
        guard.segment.as_ref().ok_or(StoreError::Closed)?;
        let db = guard
            .databases
            .get(name)
            .ok_or_else(|| StoreError::DatabaseNotFound {
                name: name.to_string(),
            })?;
        f(db)
    }
}

impl SessionHost for MultiDatabase {
    fn session_undo(&self) -> StoreResult<()> {
        self.undo()
    }

    fn session_squash(&self) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let segment = inner.segment.as_mut().ok_or(StoreError::Closed)?;
        for db in inner.databases.values_mut() {
            db.undo.squash();
        }
        inner.revision -= 1;
        segment.set_revision(inner.revision)?;
        Ok(())
    }
}
