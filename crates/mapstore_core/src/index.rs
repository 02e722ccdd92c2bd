//! The typed multi-ordered index.
//!
//! One `TypedIndex<T>` exists per registered object type. Objects live
//! serialized in per-slot cell chains inside the segment; the ordered maps
//! here are rebuilt from those chains at attach time and kept write-through
//! afterwards, so the mapped file always reflects every completed mutation.

use crate::error::{StoreError, StoreResult};
use crate::object::{IndexKey, SecondaryKeyDef, StoreObject};
use crate::types::ObjectId;
use crate::undo::UndoStack;
use mapstore_storage::{Segment, SlotId};
use std::collections::{BTreeMap, BTreeSet};

/// A live object together with the offset of its segment cell.
#[derive(Debug)]
struct Stored<T> {
    value: T,
    cell: u64,
}

/// One secondary ordering. Unique orderings map key to owner; non-unique
/// orderings hold `(key, id)` pairs so equal keys coexist.
enum SecondaryIndex {
    Unique(BTreeMap<IndexKey, ObjectId>),
    NonUnique(BTreeSet<(IndexKey, ObjectId)>),
}

/// A multi-indexed collection of one object type, persisted in the segment.
pub(crate) struct TypedIndex<T: StoreObject> {
    slot: SlotId,
    next_id: u64,
    objects: BTreeMap<ObjectId, Stored<T>>,
    secondaries: Vec<SecondaryIndex>,
    undo: UndoStack<T>,
}

impl<T: StoreObject> TypedIndex<T> {
    /// Materializes the index against the segment: registers (or, read-only,
    /// finds) the directory slot, then rebuilds the orderings by walking the
    /// slot's cell chain.
    pub fn open(segment: &mut Segment) -> StoreResult<Self> {
        let tag = u32::from(T::TYPE_TAG);
        let slot = if segment.is_writable() {
            segment.register_slot(tag)?
        } else {
            segment
                .find_slot(tag)
                .ok_or_else(|| StoreError::IndexNotFound {
                    name: T::TYPE_NAME.to_string(),
                })?
        };

        let mut index = Self {
            slot,
            next_id: segment.slot_next_id(slot)?,
            objects: BTreeMap::new(),
            secondaries: T::secondary_keys()
                .iter()
                .map(|def| {
                    if def.unique {
                        SecondaryIndex::Unique(BTreeMap::new())
                    } else {
                        SecondaryIndex::NonUnique(BTreeSet::new())
                    }
                })
                .collect(),
            undo: UndoStack::new(),
        };

        for (cell, payload) in segment.chain_cells(slot)? {
            let value: T = bincode::deserialize(&payload)?;
            let id = value.object_id();
            index.insert_keys(id, &value);
            index.objects.insert(id, Stored { value, cell });
        }

        Ok(index)
    }

    /// Creates a new object: assigns the next id, runs the initializer,
    /// checks uniqueness, then inserts into the segment and every ordering.
    pub fn create(
        &mut self,
        segment: &mut Segment,
        init: impl FnOnce(&mut T),
    ) -> StoreResult<T> {
        let id = ObjectId::new(self.next_id);
        let mut value = T::default();
        value.assign_id(id);
        init(&mut value);
        if value.object_id() != id {
            return Err(StoreError::invalid_operation("object id is immutable"));
        }

        self.check_unique(id, &value)?;

        let payload = bincode::serialize(&value)?;
        let cell = segment.chain_push(self.slot, &payload)?;
        self.insert_keys(id, &value);
        self.objects.insert(
            id,
            Stored {
                value: value.clone(),
                cell,
            },
        );

        self.next_id += 1;
        segment.set_slot_next_id(self.slot, self.next_id)?;
        self.undo.on_create(id);
        Ok(value)
    }

    /// Applies `mutate` to the object with `id`.
    ///
    /// The session snapshot is recorded before the mutator runs; the
    /// mutator itself works on a copy and re-keying is checked up front, so
    /// a uniqueness failure leaves the live object untouched.
    pub fn modify(
        &mut self,
        segment: &mut Segment,
        id: ObjectId,
        mutate: impl FnOnce(&mut T),
    ) -> StoreResult<()> {
        let (cell, before) = match self.objects.get(&id) {
            Some(stored) => (stored.cell, stored.value.clone()),
            None => return Err(self.out_of_range(id)),
        };

        self.undo.on_modify(id, &before);

        let mut after = before.clone();
        mutate(&mut after);
        if after.object_id() != id {
            return Err(StoreError::invalid_operation("object id is immutable"));
        }
        self.check_unique(id, &after)?;

        let payload = bincode::serialize(&after)?;
        let new_cell = segment.chain_update(self.slot, cell, &payload)?;

        self.remove_keys(id, &before);
        self.insert_keys(id, &after);
        let stored = self.objects.get_mut(&id).expect("object checked above");
        stored.value = after;
        stored.cell = new_cell;
        Ok(())
    }

    /// Removes the object with `id` from the segment and every ordering.
    pub fn remove(&mut self, segment: &mut Segment, id: ObjectId) -> StoreResult<()> {
        let (cell, before) = match self.objects.get(&id) {
            Some(stored) => (stored.cell, stored.value.clone()),
            None => return Err(self.out_of_range(id)),
        };

        segment.chain_remove(self.slot, cell)?;
        self.undo.on_remove(id, &before);
        self.remove_keys(id, &before);
        self.objects.remove(&id);
        Ok(())
    }

    /// Looks up an object by id, failing with `OutOfRange` on a miss.
    pub fn get(&self, id: ObjectId) -> StoreResult<&T> {
        self.find(id).ok_or_else(|| self.out_of_range(id))
    }

    /// Looks up an object by id.
    pub fn find(&self, id: ObjectId) -> Option<&T> {
        self.objects.get(&id).map(|s| &s.value)
    }

    /// Looks up an object through the named secondary ordering.
    pub fn find_by(&self, key_name: &str, key: &IndexKey) -> Option<&T> {
        let position = T::secondary_keys()
            .iter()
            .position(|def| def.name == key_name)?;
        let id = match &self.secondaries[position] {
            SecondaryIndex::Unique(map) => *map.get(key)?,
            SecondaryIndex::NonUnique(set) => {
                let start = (key.clone(), ObjectId::new(0));
                let (found, id) = set.range(start..).next()?;
                if found != key {
                    return None;
                }
                *id
            }
        };
        self.find(id)
    }

    /// Like [`Self::find_by`] but fails on a miss.
    pub fn get_by(&self, key_name: &str, key: &IndexKey) -> StoreResult<&T> {
        self.find_by(key_name, key)
            .ok_or_else(|| StoreError::KeyNotFound {
                index: format!("{}::{}", T::TYPE_NAME, key_name),
            })
    }

    /// Iterates objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.objects.values().map(|s| &s.value)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    // ---- undo -------------------------------------------------------------

    pub fn start_undo(&mut self, revision: u64) {
        self.undo.start_undo(revision, self.next_id);
    }

    pub fn has_undo_state(&self) -> bool {
        self.undo.is_enabled()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.depth()
    }

    pub fn squash(&mut self) {
        self.undo.squash();
    }

    pub fn commit(&mut self, revision: u64) {
        self.undo.commit(revision);
    }

    /// Reverts the top undo state: deletes this session's creates, restores
    /// modified objects from their snapshots, re-inserts removed objects,
    /// then winds the id counter back.
    pub fn undo(&mut self, segment: &mut Segment) -> StoreResult<()> {
        let Some(state) = self.undo.pop() else {
            return Ok(());
        };

        for id in &state.new_ids {
            let stored = self.objects.remove(id).ok_or_else(|| {
                StoreError::invalid_operation(format!(
                    "undo state references missing object {id} in index {}",
                    T::TYPE_NAME
                ))
            })?;
            self.remove_keys(*id, &stored.value);
            segment.chain_remove(self.slot, stored.cell)?;
        }

        for (id, snapshot) in state.old_values {
            match self.objects.get(&id) {
                Some(stored) => {
                    let cell = stored.cell;
                    let before = stored.value.clone();
                    let payload = bincode::serialize(&snapshot)?;
                    let new_cell = segment.chain_update(self.slot, cell, &payload)?;
                    self.remove_keys(id, &before);
                    self.insert_keys(id, &snapshot);
                    let stored = self.objects.get_mut(&id).expect("object checked above");
                    stored.value = snapshot;
                    stored.cell = new_cell;
                }
                None => self.reinsert(segment, id, snapshot)?,
            }
        }

        for (id, snapshot) in state.removed_values {
            self.reinsert(segment, id, snapshot)?;
        }

        self.next_id = state.old_next_id;
        segment.set_slot_next_id(self.slot, self.next_id)?;
        Ok(())
    }

    fn reinsert(&mut self, segment: &mut Segment, id: ObjectId, snapshot: T) -> StoreResult<()> {
        let payload = bincode::serialize(&snapshot)?;
        let cell = segment.chain_push(self.slot, &payload)?;
        self.insert_keys(id, &snapshot);
        self.objects.insert(
            id,
            Stored {
                value: snapshot,
                cell,
            },
        );
        Ok(())
    }

    // ---- orderings --------------------------------------------------------

    fn defs() -> &'static [SecondaryKeyDef<T>] {
        T::secondary_keys()
    }

    fn check_unique(&self, id: ObjectId, value: &T) -> StoreResult<()> {
        for (def, secondary) in Self::defs().iter().zip(&self.secondaries) {
            if let SecondaryIndex::Unique(map) = secondary {
                let key = (def.extract)(value);
                if let Some(&owner) = map.get(&key) {
                    if owner != id {
                        return Err(StoreError::uniqueness(format!(
                            "{}::{}",
                            T::TYPE_NAME,
                            def.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn insert_keys(&mut self, id: ObjectId, value: &T) {
        for (def, secondary) in Self::defs().iter().zip(&mut self.secondaries) {
            let key = (def.extract)(value);
            match secondary {
                SecondaryIndex::Unique(map) => {
                    map.insert(key, id);
                }
                SecondaryIndex::NonUnique(set) => {
                    set.insert((key, id));
                }
            }
        }
    }

    fn remove_keys(&mut self, id: ObjectId, value: &T) {
        for (def, secondary) in Self::defs().iter().zip(&mut self.secondaries) {
            let key = (def.extract)(value);
            match secondary {
                SecondaryIndex::Unique(map) => {
                    if map.get(&key) == Some(&id) {
                        map.remove(&key);
                    }
                }
                SecondaryIndex::NonUnique(set) => {
                    set.remove(&(key, id));
                }
            }
        }
    }

    fn out_of_range(&self, id: ObjectId) -> StoreError {
        StoreError::OutOfRange {
            id: id.as_u64(),
            index: T::TYPE_NAME.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapstore_storage::{OpenMode, MIN_SEGMENT_SIZE};
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct Account {
        id: ObjectId,
        name: String,
        balance: i64,
    }

    impl StoreObject for Account {
        const TYPE_TAG: u16 = 1;
        const TYPE_NAME: &'static str = "account";

        fn object_id(&self) -> ObjectId {
            self.id
        }

        fn assign_id(&mut self, id: ObjectId) {
            self.id = id;
        }

        fn secondary_keys() -> &'static [SecondaryKeyDef<Self>] {
            const KEYS: &[SecondaryKeyDef<Account>] = &[
                SecondaryKeyDef {
                    name: "by_name",
                    unique: true,
                    extract: |a| IndexKey::Str(a.name.clone()),
                },
                SecondaryKeyDef {
                    name: "by_balance",
                    unique: false,
                    extract: |a| IndexKey::Int(a.balance),
                },
            ];
            KEYS
        }
    }

    fn open_segment(dir: &std::path::Path) -> Segment {
        Segment::open(dir, OpenMode::ReadWrite, MIN_SEGMENT_SIZE).unwrap()
    }

    #[test]
    fn create_assigns_monotonic_ids() {
        let temp = tempdir().unwrap();
        let mut seg = open_segment(temp.path());
        let mut index = TypedIndex::<Account>::open(&mut seg).unwrap();

        for i in 0..3 {
            let a = index
                .create(&mut seg, |a| {
                    a.name = format!("acct-{i}");
                    a.balance = i;
                })
                .unwrap();
            assert_eq!(a.id, ObjectId::new(i as u64));
        }
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn unique_violation_leaves_store_unchanged() {
        let temp = tempdir().unwrap();
        let mut seg = open_segment(temp.path());
        let mut index = TypedIndex::<Account>::open(&mut seg).unwrap();

        index
            .create(&mut seg, |a| a.name = "alice".into())
            .unwrap();
        let err = index
            .create(&mut seg, |a| a.name = "alice".into())
            .unwrap_err();
        assert!(matches!(err, StoreError::Uniqueness { .. }));
        assert_eq!(index.len(), 1);
        // The failed create must not burn an id.
        let bob = index.create(&mut seg, |a| a.name = "bob".into()).unwrap();
        assert_eq!(bob.id, ObjectId::new(1));
    }

    #[test]
    fn modify_rekeys_secondaries() {
        let temp = tempdir().unwrap();
        let mut seg = open_segment(temp.path());
        let mut index = TypedIndex::<Account>::open(&mut seg).unwrap();

        let a = index
            .create(&mut seg, |a| {
                a.name = "alice".into();
                a.balance = 10;
            })
            .unwrap();

        index
            .modify(&mut seg, a.id, |a| {
                a.name = "alicia".into();
                a.balance = 20;
            })
            .unwrap();

        assert!(index.find_by("by_name", &IndexKey::from("alice")).is_none());
        let hit = index
            .find_by("by_name", &IndexKey::from("alicia"))
            .unwrap();
        assert_eq!(hit.balance, 20);
        assert!(index.find_by("by_balance", &IndexKey::Int(10)).is_none());
        assert!(index.find_by("by_balance", &IndexKey::Int(20)).is_some());
    }

    #[test]
    fn modify_uniqueness_conflict_keeps_object_intact() {
        let temp = tempdir().unwrap();
        let mut seg = open_segment(temp.path());
        let mut index = TypedIndex::<Account>::open(&mut seg).unwrap();

        index
            .create(&mut seg, |a| a.name = "alice".into())
            .unwrap();
        let bob = index.create(&mut seg, |a| a.name = "bob".into()).unwrap();

        let err = index
            .modify(&mut seg, bob.id, |a| a.name = "alice".into())
            .unwrap_err();
        assert!(matches!(err, StoreError::Uniqueness { .. }));

        let still_bob = index.get(bob.id).unwrap();
        assert_eq!(still_bob.name, "bob");
        assert!(index.find_by("by_name", &IndexKey::from("bob")).is_some());
    }

    #[test]
    fn remove_erases_all_orderings() {
        let temp = tempdir().unwrap();
        let mut seg = open_segment(temp.path());
        let mut index = TypedIndex::<Account>::open(&mut seg).unwrap();

        let a = index
            .create(&mut seg, |a| {
                a.name = "alice".into();
                a.balance = 5;
            })
            .unwrap();
        index.remove(&mut seg, a.id).unwrap();

        assert!(index.find(a.id).is_none());
        assert!(index.find_by("by_name", &IndexKey::from("alice")).is_none());
        assert!(index.find_by("by_balance", &IndexKey::Int(5)).is_none());
        assert!(matches!(
            index.get(a.id),
            Err(StoreError::OutOfRange { .. })
        ));
    }

    #[test]
    fn orderings_rebuild_on_reattach() {
        let temp = tempdir().unwrap();
        {
            let mut seg = open_segment(temp.path());
            let mut index = TypedIndex::<Account>::open(&mut seg).unwrap();
            index
                .create(&mut seg, |a| {
                    a.name = "alice".into();
                    a.balance = 1;
                })
                .unwrap();
            index
                .create(&mut seg, |a| {
                    a.name = "bob".into();
                    a.balance = 2;
                })
                .unwrap();
        }

        let mut seg = open_segment(temp.path());
        let index = TypedIndex::<Account>::open(&mut seg).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(
            index
                .find_by("by_name", &IndexKey::from("bob"))
                .unwrap()
                .balance,
            2
        );
        assert_eq!(index.get(ObjectId::new(0)).unwrap().name, "alice");
    }

    #[test]
    fn undo_restores_exact_prior_state() {
        let temp = tempdir().unwrap();
        let mut seg = open_segment(temp.path());
        let mut index = TypedIndex::<Account>::open(&mut seg).unwrap();

        let a = index
            .create(&mut seg, |a| {
                a.name = "alice".into();
                a.balance = 1;
            })
            .unwrap();

        index.start_undo(1);
        index
            .modify(&mut seg, a.id, |a| a.balance = 100)
            .unwrap();
        index.remove(&mut seg, a.id).unwrap();
        index
            .create(&mut seg, |a| a.name = "carol".into())
            .unwrap();

        index.undo(&mut seg).unwrap();

        assert_eq!(index.len(), 1);
        let restored = index.get(a.id).unwrap();
        assert_eq!(restored.name, "alice");
        assert_eq!(restored.balance, 1);
        // Counter wound back: the next create reuses the undone id.
        let next = index.create(&mut seg, |a| a.name = "dave".into()).unwrap();
        assert_eq!(next.id, ObjectId::new(1));
    }
}
