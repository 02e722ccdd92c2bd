//! Dynamic databases: named tables over one shared undo structure.
//!
//! Every cell of the dynamic subsystem lives in one segment chain (the
//! shell's slot). Three cell shapes are distinguished by [`DynCell`]:
//! database roots, table metadata and records. A table's metadata cell is
//! rewritten in place when its id counter moves; record cells relocate only
//! when a value outgrows its block.

use crate::dynamic::index::DynamicIndex;
use crate::dynamic::record::{ComparisonKind, Record};
use crate::error::{StoreError, StoreResult};
use crate::types::RecordId;
use mapstore_storage::{Segment, SlotId};
use std::collections::{BTreeMap, BTreeSet};

/// On-disk payload of one cell in the dynamic chain.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) enum DynCell {
    /// Root cell of a named database.
    Database {
        /// The database name.
        name: String,
    },
    /// Metadata cell of a table.
    Table {
        /// Owning database.
        db: String,
        /// Table name.
        name: String,
        /// Primary key comparison mode.
        primary: ComparisonKind,
        /// Secondary key comparison mode.
        secondary: ComparisonKind,
        /// Persisted id counter.
        next_id: RecordId,
    },
    /// One record.
    Record {
        /// Owning database.
        db: String,
        /// Owning table.
        table: String,
        /// The record.
        record: Record,
    },
}

/// A named table: one dynamic index plus its metadata cell.
#[derive(Debug)]
pub(crate) struct Table {
    pub name: String,
    pub meta_cell: u64,
    pub index: DynamicIndex,
}

/// Snapshot of a whole table, recorded when the table is removed inside a
/// session.
#[derive(Debug)]
pub(crate) struct TableSnapshot {
    primary: ComparisonKind,
    secondary: ComparisonKind,
    next_id: RecordId,
    records: Vec<Record>,
}

type RecordKey = (String, RecordId);

/// Captured prior state for one session over all tables of a database.
#[derive(Debug, Default)]
pub(crate) struct DynUndoState {
    revision: u64,
    new_records: BTreeSet<RecordKey>,
    old_records: BTreeMap<RecordKey, Record>,
    removed_records: BTreeMap<RecordKey, Record>,
    new_tables: BTreeSet<String>,
    removed_tables: BTreeMap<String, TableSnapshot>,
    old_next_ids: BTreeMap<String, RecordId>,
}

/// Undo stack shared by every table of one dynamic database.
#[derive(Debug, Default)]
pub(crate) struct DynUndoStack {
    states: Vec<DynUndoState>,
}

impl DynUndoStack {
    pub fn start_undo(&mut self, revision: u64) {
        self.states.push(DynUndoState {
            revision,
            ..DynUndoState::default()
        });
    }

    pub fn is_enabled(&self) -> bool {
        !self.states.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.states.len()
    }

    fn pop(&mut self) -> Option<DynUndoState> {
        self.states.pop()
    }

    pub fn commit(&mut self, revision: u64) {
        self.states.retain(|s| s.revision > revision);
    }

    fn on_create_table(&mut self, name: &str) {
        if let Some(state) = self.states.last_mut() {
            state.new_tables.insert(name.to_string());
        }
    }

    fn on_remove_table(&mut self, name: &str, snapshot: impl FnOnce() -> TableSnapshot) {
        let Some(state) = self.states.last_mut() else {
            return;
        };
        if state.new_tables.remove(name) {
            // Created this session: from the session's perspective the
            // table never existed, so its record entries go too.
            state.new_records.retain(|(table, _)| table != name);
            return;
        }
        state
            .removed_tables
            .entry(name.to_string())
            .or_insert_with(snapshot);
    }

    fn on_create_record(&mut self, table: &str, id: RecordId, prior_next_id: RecordId) {
        if let Some(state) = self.states.last_mut() {
            state
                .old_next_ids
                .entry(table.to_string())
                .or_insert(prior_next_id);
            state.new_records.insert((table.to_string(), id));
        }
    }

    fn on_modify_record(&mut self, table: &str, id: RecordId, current: &Record) {
        let Some(state) = self.states.last_mut() else {
            return;
        };
        let key = (table.to_string(), id);
        if state.new_records.contains(&key)
            || state.old_records.contains_key(&key)
            || state.removed_records.contains_key(&key)
        {
            return;
        }
        state.old_records.insert(key, current.clone());
    }

    fn on_remove_record(&mut self, table: &str, id: RecordId, current: &Record) {
        let Some(state) = self.states.last_mut() else {
            return;
        };
        let key = (table.to_string(), id);
        if state.new_records.remove(&key) {
            return;
        }
        let snapshot = state
            .old_records
            .remove(&key)
            .unwrap_or_else(|| current.clone());
        state.removed_records.entry(key).or_insert(snapshot);
    }

    /// Merges the top state into the one below, earlier records winning;
    /// see the static stack for the per-id rules. Tables add one rule: a
    /// table created below and removed above cancels out, together with
    /// every record entry on it.
    pub fn squash(&mut self) {
        let Some(mut top) = self.states.pop() else {
            return;
        };
        let Some(below) = self.states.last_mut() else {
            return;
        };

        for name in std::mem::take(&mut top.new_tables) {
            below.new_tables.insert(name);
        }

        for (name, snapshot) in std::mem::take(&mut top.removed_tables) {
            if below.new_tables.remove(&name) {
                below.new_records.retain(|(table, _)| *table != name);
                below.old_records.retain(|(table, _), _| *table != name);
                below.removed_records.retain(|(table, _), _| *table != name);
                top.new_records.retain(|(table, _)| *table != name);
                top.old_records.retain(|(table, _), _| *table != name);
                top.removed_records.retain(|(table, _), _| *table != name);
                continue;
            }
            below.removed_tables.entry(name).or_insert(snapshot);
        }

        for (name, next_id) in top.old_next_ids {
            below.old_next_ids.entry(name).or_insert(next_id);
        }

        for key in top.new_records {
            below.new_records.insert(key);
        }

        for (key, snapshot) in top.old_records {
            if below.new_records.contains(&key)
                || below.old_records.contains_key(&key)
                || below.removed_records.contains_key(&key)
            {
                continue;
            }
            below.old_records.insert(key, snapshot);
        }

        for (key, snapshot) in top.removed_records {
            if below.new_records.remove(&key) {
                continue;
            }
            if let Some(earlier) = below.old_records.remove(&key) {
                below.removed_records.insert(key, earlier);
                continue;
            }
            below.removed_records.entry(key).or_insert(snapshot);
        }
    }
}

/// A named dynamic database: a set of tables sharing one undo stack.
#[derive(Debug)]
pub(crate) struct DynDatabase {
    pub name: String,
    pub db_cell: u64,
    pub tables: BTreeMap<String, Table>,
    pub undo: DynUndoStack,
}

impl DynDatabase {
    pub fn new(name: String, db_cell: u64) -> Self {
        Self {
            name,
            db_cell,
            tables: BTreeMap::new(),
            undo: DynUndoStack::default(),
        }
    }

    fn table(&self, name: &str) -> StoreResult<&Table> {
        self.tables.get(name).ok_or_else(|| StoreError::TableNotFound {
            name: name.to_string(),
        })
    }

    fn record_cell(&self, table: &str, record: &Record) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(&DynCell::Record {
            db: self.name.clone(),
            table: table.to_string(),
            record: record.clone(),
        })?)
    }

    fn write_table_meta(
        segment: &mut Segment,
        slot: SlotId,
        db: &str,
        table: &mut Table,
    ) -> StoreResult<()> {
        let payload = bincode::serialize(&DynCell::Table {
            db: db.to_string(),
            name: table.name.clone(),
            primary: table.index.primary_kind(),
            secondary: table.index.secondary_kind(),
            next_id: table.index.next_id,
        })?;
        table.meta_cell = segment.chain_update(slot, table.meta_cell, &payload)?;
        Ok(())
    }

    // ---- table operations -------------------------------------------------

    pub fn create_table(
        &mut self,
        segment: &mut Segment,
        slot: SlotId,
        name: &str,
        primary: ComparisonKind,
        secondary: ComparisonKind,
    ) -> StoreResult<()> {
        if self.tables.contains_key(name) {
            return Err(StoreError::AlreadyExists {
                kind: "table",
                name: name.to_string(),
            });
        }
        let payload = bincode::serialize(&DynCell::Table {
            db: self.name.clone(),
            name: name.to_string(),
            primary,
            secondary,
            next_id: 1,
        })?;
        let meta_cell = segment.chain_push(slot, &payload)?;
        self.tables.insert(
            name.to_string(),
            Table {
                name: name.to_string(),
                meta_cell,
                index: DynamicIndex::new(primary, secondary),
            },
        );
        self.undo.on_create_table(name);
        Ok(())
    }

    pub fn remove_table(
        &mut self,
        segment: &mut Segment,
        slot: SlotId,
        name: &str,
    ) -> StoreResult<()> {
        let cells: Vec<u64> = {
            let table = self.table(name)?;
            table.index.cells().chain([table.meta_cell]).collect()
        };
        for cell in cells {
            segment.chain_remove(slot, cell)?;
        }
        let table = self.tables.remove(name).expect("table checked above");
        self.undo.on_remove_table(name, || TableSnapshot {
            primary: table.index.primary_kind(),
            secondary: table.index.secondary_kind(),
            next_id: table.index.next_id,
            records: table.index.records().cloned().collect(),
        });
        Ok(())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    // ---- record operations ------------------------------------------------

    pub fn create_record(
        &mut self,
        segment: &mut Segment,
        slot: SlotId,
        table_name: &str,
        primary: i128,
        secondary: i128,
        value: Vec<u8>,
    ) -> StoreResult<Record> {
        self.table(table_name)?;
        let id = self.tables[table_name].index.next_id;
        let record = Record {
            id,
            primary,
            secondary,
            value,
        };
        let payload = self.record_cell(table_name, &record)?;
        let cell = segment.chain_push(slot, &payload)?;

        let db_name = self.name.clone();
        let table = self.tables.get_mut(table_name).expect("table checked above");
        table.index.insert(record.clone(), cell)?;
        table.index.next_id += 1;
        Self::write_table_meta(segment, slot, &db_name, table)?;

        self.undo.on_create_record(table_name, id, id);
        Ok(record)
    }

    pub fn modify_record(
        &mut self,
        segment: &mut Segment,
        slot: SlotId,
        table_name: &str,
        id: RecordId,
        primary: i128,
        secondary: i128,
        value: Vec<u8>,
    ) -> StoreResult<()> {
        let (before, cell) = {
            let table = self.table(table_name)?;
            let stored = table
                .index
                .stored(id)
                .ok_or_else(|| StoreError::RecordNotFound {
                    key: "id",
                    table: table_name.to_string(),
                })?;
            (stored.record.clone(), stored.cell)
        };

        self.undo.on_modify_record(table_name, id, &before);

        let updated = Record {
            id,
            primary,
            secondary,
            value,
        };
        let payload = self.record_cell(table_name, &updated)?;
        let new_cell = segment.chain_update(slot, cell, &payload)?;
        let table = self.tables.get_mut(table_name).expect("table checked above");
        table.index.replace(updated, new_cell);
        Ok(())
    }

    pub fn remove_record(
        &mut self,
        segment: &mut Segment,
        slot: SlotId,
        table_name: &str,
        id: RecordId,
    ) -> StoreResult<()> {
        let cell = {
            let table = self.table(table_name)?;
            table
                .index
                .stored(id)
                .ok_or_else(|| StoreError::RecordNotFound {
                    key: "id",
                    table: table_name.to_string(),
                })?
                .cell
        };
        segment.chain_remove(slot, cell)?;
        let table = self.tables.get_mut(table_name).expect("table checked above");
        let stored = table.index.remove(id).expect("record checked above");
        self.undo.on_remove_record(table_name, id, &stored.record);
        Ok(())
    }

    // ---- lookups ----------------------------------------------------------

    pub fn find_record_by_id(&self, table: &str, id: RecordId) -> StoreResult<Option<&Record>> {
        Ok(self.table(table)?.index.find_by_id(id))
    }

    pub fn find_record_by_primary(
        &self,
        table: &str,
        primary: i128,
    ) -> StoreResult<Option<&Record>> {
        Ok(self.table(table)?.index.find_by_primary(primary))
    }

    pub fn find_record_by_secondary(
        &self,
        table: &str,
        secondary: i128,
    ) -> StoreResult<Option<&Record>> {
        Ok(self.table(table)?.index.find_by_secondary(secondary))
    }

    // ---- undo -------------------------------------------------------------

    /// Reverts the top undo state across every table of this database.
    ///
    /// Order matters: tables created in the session are dropped first (with
    /// all their records), then removed tables are rebuilt from their
    /// snapshots, then record-level state is restored into the tables that
    /// now all exist again.
    pub fn undo(&mut self, segment: &mut Segment, slot: SlotId) -> StoreResult<()> {
        let Some(state) = self.undo.pop() else {
            return Ok(());
        };
        let db_name = self.name.clone();

        for name in &state.new_tables {
            if let Some(table) = self.tables.remove(name) {
                for cell in table.index.cells() {
                    segment.chain_remove(slot, cell)?;
                }
                segment.chain_remove(slot, table.meta_cell)?;
            }
        }

        for (table_name, id) in &state.new_records {
            let Some(table) = self.tables.get_mut(table_name) else {
                continue; // table dropped above
            };
            if let Some(stored) = table.index.remove(*id) {
                segment.chain_remove(slot, stored.cell)?;
            }
        }

        for (name, snapshot) in state.removed_tables {
            let meta_payload = bincode::serialize(&DynCell::Table {
                db: db_name.clone(),
                name: name.clone(),
                primary: snapshot.primary,
                secondary: snapshot.secondary,
                next_id: snapshot.next_id,
            })?;
            let meta_cell = segment.chain_push(slot, &meta_payload)?;
            let mut index = DynamicIndex::new(snapshot.primary, snapshot.secondary);
            index.next_id = snapshot.next_id;
            for record in snapshot.records {
                let payload = bincode::serialize(&DynCell::Record {
                    db: db_name.clone(),
                    table: name.clone(),
                    record: record.clone(),
                })?;
                let cell = segment.chain_push(slot, &payload)?;
                index.insert(record, cell)?;
            }
            self.tables.insert(
                name.clone(),
                Table {
                    name,
                    meta_cell,
                    index,
                },
            );
        }

        for ((table_name, id), snapshot) in state.old_records {
            let payload = self.record_cell(&table_name, &snapshot)?;
            let Some(table) = self.tables.get_mut(&table_name) else {
                continue;
            };
            match table.index.stored(id) {
                Some(stored) => {
                    let new_cell = segment.chain_update(slot, stored.cell, &payload)?;
                    table.index.replace(snapshot, new_cell);
                }
                None => {
                    let cell = segment.chain_push(slot, &payload)?;
                    table.index.insert(snapshot, cell)?;
                }
            }
        }

        for ((table_name, _), snapshot) in state.removed_records {
            let payload = self.record_cell(&table_name, &snapshot)?;
            let Some(table) = self.tables.get_mut(&table_name) else {
                continue;
            };
            let cell = segment.chain_push(slot, &payload)?;
            table.index.insert(snapshot, cell)?;
        }

        for (table_name, next_id) in state.old_next_ids {
            if let Some(table) = self.tables.get_mut(&table_name) {
                table.index.next_id = next_id;
                Self::write_table_meta(segment, slot, &db_name, table)?;
            }
        }

        Ok(())
    }

    /// All cells belonging to this database (used by `remove_database`).
    pub fn all_cells(&self) -> Vec<u64> {
        let mut cells = vec![self.db_cell];
        for table in self.tables.values() {
            cells.push(table.meta_cell);
            cells.extend(table.index.cells());
        }
        cells
    }
}

/// Mutation handle over one dynamic database, given out by
/// [`MultiDatabase::modify`](crate::MultiDatabase::modify).
///
/// Every mutation made through the handle is captured by the database's
/// undo stack (when a session is active).
pub struct DatabaseHandle<'a> {
    pub(crate) segment: &'a mut Segment,
    pub(crate) slot: SlotId,
    pub(crate) db: &'a mut DynDatabase,
}

impl DatabaseHandle<'_> {
    /// Creates a table ordering both keys as signed integers.
    pub fn create_table(&mut self, name: &str) -> StoreResult<()> {
        self.create_table_with(name, ComparisonKind::Integer, ComparisonKind::Integer)
    }

    /// Creates a table with explicit comparison modes. The modes are
    /// immutable for the life of the table.
    pub fn create_table_with(
        &mut self,
        name: &str,
        primary: ComparisonKind,
        secondary: ComparisonKind,
    ) -> StoreResult<()> {
        self.db
            .create_table(self.segment, self.slot, name, primary, secondary)
    }

    /// Removes a table and every record in it.
    pub fn remove_table(&mut self, name: &str) -> StoreResult<()> {
        self.db.remove_table(self.segment, self.slot, name)
    }

    /// True when the named table exists.
    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.db.has_table(name)
    }

    /// Names of all tables, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.db.table_names()
    }

    /// Creates a record in `table`, returning it with its assigned id.
    pub fn create(
        &mut self,
        table: &str,
        primary: i128,
        secondary: i128,
        value: impl Into<Vec<u8>>,
    ) -> StoreResult<Record> {
        self.db
            .create_record(self.segment, self.slot, table, primary, secondary, value.into())
    }

    /// Rewrites the keys and value of the record with `id`.
    pub fn modify(
        &mut self,
        table: &str,
        id: RecordId,
        primary: i128,
        secondary: i128,
        value: impl Into<Vec<u8>>,
    ) -> StoreResult<()> {
        self.db.modify_record(
            self.segment,
            self.slot,
            table,
            id,
            primary,
            secondary,
            value.into(),
        )
    }

    /// Removes the record with `id`.
    pub fn remove(&mut self, table: &str, id: RecordId) -> StoreResult<()> {
        self.db.remove_record(self.segment, self.slot, table, id)
    }

    /// Looks up a record by id.
    pub fn find_by_id(&self, table: &str, id: RecordId) -> StoreResult<Option<Record>> {
        Ok(self.db.find_record_by_id(table, id)?.cloned())
    }

    /// Looks up a record by id, failing on a miss.
    pub fn get_by_id(&self, table: &str, id: RecordId) -> StoreResult<Record> {
        self.find_by_id(table, id)?
            .ok_or_else(|| StoreError::RecordNotFound {
                key: "id",
                table: table.to_string(),
            })
    }

    /// Looks up the first record with this primary key.
    pub fn find_by_primary(&self, table: &str, primary: i128) -> StoreResult<Option<Record>> {
        Ok(self.db.find_record_by_primary(table, primary)?.cloned())
    }

    /// Looks up the first record with this primary key, failing on a miss.
    pub fn get_by_primary(&self, table: &str, primary: i128) -> StoreResult<Record> {
        self.find_by_primary(table, primary)?
            .ok_or_else(|| StoreError::RecordNotFound {
                key: "primary",
                table: table.to_string(),
            })
    }

    /// Looks up the first record with this secondary key.
    pub fn find_by_secondary(&self, table: &str, secondary: i128) -> StoreResult<Option<Record>> {
        Ok(self.db.find_record_by_secondary(table, secondary)?.cloned())
    }

    /// Looks up the first record with this secondary key, failing on a miss.
    pub fn get_by_secondary(&self, table: &str, secondary: i128) -> StoreResult<Record> {
        self.find_by_secondary(table, secondary)?
            .ok_or_else(|| StoreError::RecordNotFound {
                key: "secondary",
                table: table.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RecordId) -> Record {
        Record {
            id,
            primary: i128::from(id),
            secondary: 0,
            value: Vec::new(),
        }
    }

    #[test]
    fn squash_cancels_table_created_below_removed_above() {
        let mut stack = DynUndoStack::default();
        stack.start_undo(1);
        stack.on_create_table("t");
        stack.on_create_record("t", 1, 1);
        stack.start_undo(2);
        stack.on_remove_table("t", || TableSnapshot {
            primary: ComparisonKind::Integer,
            secondary: ComparisonKind::Integer,
            next_id: 2,
            records: vec![record(1)],
        });

        stack.squash();

        let state = stack.pop().unwrap();
        assert!(state.new_tables.is_empty());
        assert!(state.removed_tables.is_empty());
        assert!(state.new_records.is_empty());
    }

    #[test]
    fn remove_table_created_this_session_leaves_no_trace() {
        let mut stack = DynUndoStack::default();
        stack.start_undo(1);
        stack.on_create_table("t");
        stack.on_create_record("t", 1, 1);
        stack.on_remove_table("t", || unreachable!("created tables are not snapshotted"));

        let state = stack.pop().unwrap();
        assert!(state.new_tables.is_empty());
        assert!(state.new_records.is_empty());
        assert!(state.removed_tables.is_empty());
    }

    #[test]
    fn squash_keeps_earliest_record_snapshot() {
        let mut stack = DynUndoStack::default();
        stack.start_undo(1);
        stack.on_modify_record("t", 1, &record(1));
        stack.start_undo(2);
        let mut later = record(1);
        later.primary = 99;
        stack.on_modify_record("t", 1, &later);

        stack.squash();

        let state = stack.pop().unwrap();
        assert_eq!(
            state.old_records[&("t".to_string(), 1)].primary,
            i128::from(1u32)
        );
    }

    #[test]
    fn commit_truncates_by_revision() {
        let mut stack = DynUndoStack::default();
        stack.start_undo(5);
        stack.start_undo(6);
        stack.commit(5);
        assert_eq!(stack.depth(), 1);
    }
}
