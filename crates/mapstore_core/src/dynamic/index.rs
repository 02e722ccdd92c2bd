//! The in-memory orderings of one dynamic table.
//!
//! Three unique orderings over the same records: by id, by
//! `(primary, secondary, id)` and by `(secondary, primary, id)`. Keys are
//! compared under the index's comparison modes via order-preserving byte
//! encodings, so the composite maps can stay plain `BTreeMap`s.
//!
//! Cell persistence and undo bookkeeping live one level up, in the dynamic
//! database, which drives this purely in-memory structure.

use crate::dynamic::record::{ComparisonKind, Record};
use crate::error::{StoreError, StoreResult};
use crate::types::RecordId;
use std::collections::BTreeMap;

type CompositeKey = ([u8; 16], [u8; 16], RecordId);

/// A record plus the offset of its segment cell.
#[derive(Debug)]
pub(crate) struct StoredRecord {
    pub record: Record,
    pub cell: u64,
}

/// One table's record collection with its three orderings.
#[derive(Debug)]
pub(crate) struct DynamicIndex {
    primary_kind: ComparisonKind,
    secondary_kind: ComparisonKind,
    pub next_id: RecordId,
    by_id: BTreeMap<RecordId, StoredRecord>,
    by_primary: BTreeMap<CompositeKey, RecordId>,
    by_secondary: BTreeMap<CompositeKey, RecordId>,
}

impl DynamicIndex {
    pub fn new(primary_kind: ComparisonKind, secondary_kind: ComparisonKind) -> Self {
        Self {
            primary_kind,
            secondary_kind,
            next_id: 1,
            by_id: BTreeMap::new(),
            by_primary: BTreeMap::new(),
            by_secondary: BTreeMap::new(),
        }
    }

    pub fn primary_kind(&self) -> ComparisonKind {
        self.primary_kind
    }

    pub fn secondary_kind(&self) -> ComparisonKind {
        self.secondary_kind
    }

    fn primary_key(&self, record: &Record) -> CompositeKey {
        (
            self.primary_kind.encode(record.primary),
            self.secondary_kind.encode(record.secondary),
            record.id,
        )
    }

    fn secondary_key(&self, record: &Record) -> CompositeKey {
        (
            self.secondary_kind.encode(record.secondary),
            self.primary_kind.encode(record.primary),
            record.id,
        )
    }

    /// Links a record into all three orderings.
    pub fn insert(&mut self, record: Record, cell: u64) -> StoreResult<()> {
        if self.by_id.contains_key(&record.id) {
            return Err(StoreError::uniqueness("by_id"));
        }
        self.by_primary.insert(self.primary_key(&record), record.id);
        self.by_secondary
            .insert(self.secondary_key(&record), record.id);
        self.by_id
            .insert(record.id, StoredRecord { record, cell });
        Ok(())
    }

    /// Unlinks a record from all three orderings.
    pub fn remove(&mut self, id: RecordId) -> Option<StoredRecord> {
        let stored = self.by_id.remove(&id)?;
        self.by_primary.remove(&self.primary_key(&stored.record));
        self.by_secondary
            .remove(&self.secondary_key(&stored.record));
        Some(stored)
    }

    /// Replaces a record's keys and value, keeping its id and cell.
    pub fn replace(&mut self, updated: Record, cell: u64) {
        if let Some(stored) = self.by_id.remove(&updated.id) {
            self.by_primary.remove(&self.primary_key(&stored.record));
            self.by_secondary
                .remove(&self.secondary_key(&stored.record));
        }
        self.by_primary
            .insert(self.primary_key(&updated), updated.id);
        self.by_secondary
            .insert(self.secondary_key(&updated), updated.id);
        self.by_id
            .insert(updated.id, StoredRecord { record: updated, cell });
    }

    pub fn stored(&self, id: RecordId) -> Option<&StoredRecord> {
        self.by_id.get(&id)
    }

    pub fn find_by_id(&self, id: RecordId) -> Option<&Record> {
        self.by_id.get(&id).map(|s| &s.record)
    }

    /// First record (in `(primary, secondary, id)` order) whose primary key
    /// equals `primary`.
    pub fn find_by_primary(&self, primary: i128) -> Option<&Record> {
        let prefix = self.primary_kind.encode(primary);
        let start = (prefix, [0u8; 16], RecordId::MIN);
        let (&(found, _, _), &id) = self.by_primary.range(start..).next()?;
        if found != prefix {
            return None;
        }
        self.find_by_id(id)
    }

    /// First record (in `(secondary, primary, id)` order) whose secondary
    /// key equals `secondary`.
    pub fn find_by_secondary(&self, secondary: i128) -> Option<&Record> {
        let prefix = self.secondary_kind.encode(secondary);
        let start = (prefix, [0u8; 16], RecordId::MIN);
        let (&(found, _, _), &id) = self.by_secondary.range(start..).next()?;
        if found != prefix {
            return None;
        }
        self.find_by_id(id)
    }

    /// All records in id order (used for table snapshots).
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.by_id.values().map(|s| &s.record)
    }

    /// All cells in the index (used when dropping a whole table).
    pub fn cells(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_id.values().map(|s| s.cell)
    }
}
