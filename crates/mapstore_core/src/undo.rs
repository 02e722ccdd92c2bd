//! Per-index undo state bookkeeping.
//!
//! Every undo session pushes one [`UndoState`] per index. Mutations record
//! just enough prior state to revert:
//!
//! - an object created during the session only needs its id (`new_ids`)
//! - the first in-session modification of a pre-existing object snapshots
//!   the object (`old_values`); later modifications keep the earliest
//!   snapshot
//! - removal of a pre-existing object moves its session-start snapshot into
//!   `removed_values`; removal of an object created in the session drops it
//!   from `new_ids` with no record at all
//!
//! Applying the recorded state back to the index lives in the index types;
//! this module owns the recording and the `squash` / `commit` stack
//! algebra, which is identical for every index.

use crate::types::ObjectId;
use std::collections::{BTreeMap, BTreeSet};

/// Captured prior state for one session on one index.
#[derive(Debug)]
pub(crate) struct UndoState<T> {
    /// Revision assigned when the state was pushed.
    pub revision: u64,
    /// The index's id counter at session start.
    pub old_next_id: u64,
    /// Ids of objects created during the session.
    pub new_ids: BTreeSet<ObjectId>,
    /// Session-start snapshots of objects modified during the session.
    pub old_values: BTreeMap<ObjectId, T>,
    /// Session-start snapshots of objects removed during the session.
    pub removed_values: BTreeMap<ObjectId, T>,
}

impl<T> UndoState<T> {
    fn new(revision: u64, old_next_id: u64) -> Self {
        Self {
            revision,
            old_next_id,
            new_ids: BTreeSet::new(),
            old_values: BTreeMap::new(),
            removed_values: BTreeMap::new(),
        }
    }
}

/// Stack of undo states for one index, bottom = earliest still reversible.
#[derive(Debug)]
pub(crate) struct UndoStack<T> {
    states: Vec<UndoState<T>>,
}

impl<T: Clone> UndoStack<T> {
    pub fn new() -> Self {
        Self { states: Vec::new() }
    }

    /// Pushes a fresh state for a new session.
    pub fn start_undo(&mut self, revision: u64, next_id: u64) {
        self.states.push(UndoState::new(revision, next_id));
    }

    /// True while at least one session is recording.
    pub fn is_enabled(&self) -> bool {
        !self.states.is_empty()
    }

    /// Number of states on the stack.
    pub fn depth(&self) -> usize {
        self.states.len()
    }

    /// Revision of the top state, 0 when the stack is empty.
    pub fn revision(&self) -> u64 {
        self.states.last().map_or(0, |s| s.revision)
    }

    /// Pops the top state for the index to apply.
    pub fn pop(&mut self) -> Option<UndoState<T>> {
        self.states.pop()
    }

    /// Records a create.
    pub fn on_create(&mut self, id: ObjectId) {
        if let Some(state) = self.states.last_mut() {
            state.new_ids.insert(id);
        }
    }

    /// Records a modify, snapshotting `current` unless the object was
    /// created this session or a snapshot already exists.
    pub fn on_modify(&mut self, id: ObjectId, current: &T) {
        let Some(state) = self.states.last_mut() else {
            return;
        };
        if state.new_ids.contains(&id)
            || state.old_values.contains_key(&id)
            || state.removed_values.contains_key(&id)
        {
            return;
        }
        state.old_values.insert(id, current.clone());
    }

    /// Records a remove. An object created this session leaves no trace;
    /// otherwise the session-start snapshot lands in `removed_values`.
    pub fn on_remove(&mut self, id: ObjectId, current: &T) {
        let Some(state) = self.states.last_mut() else {
            return;
        };
        if state.new_ids.remove(&id) {
            return;
        }
        let snapshot = state.old_values.remove(&id).unwrap_or_else(|| current.clone());
        state.removed_values.entry(id).or_insert(snapshot);
    }

    /// Merges the top state into the one below it.
    ///
    /// Earlier snapshots win: the lower state already describes how to get
    /// back to an older point in time, so the inner session's records are
    /// folded in only where the lower state has none.
    pub fn squash(&mut self) {
        let Some(top) = self.states.pop() else {
            return;
        };
        let Some(below) = self.states.last_mut() else {
            // No parent to merge into: the session's work becomes permanent.
            return;
        };

        for id in top.new_ids {
            below.new_ids.insert(id);
        }

        for (id, snapshot) in top.old_values {
            if below.new_ids.contains(&id)
                || below.old_values.contains_key(&id)
                || below.removed_values.contains_key(&id)
            {
                continue;
            }
            below.old_values.insert(id, snapshot);
        }

        for (id, snapshot) in top.removed_values {
            if below.new_ids.remove(&id) {
                // Created in the outer session, removed in the inner one:
                // from the outer session's perspective it never existed.
                continue;
            }
            if let Some(earlier) = below.old_values.remove(&id) {
                below.removed_values.insert(id, earlier);
                continue;
            }
            below.removed_values.entry(id).or_insert(snapshot);
        }

        // below.old_next_id already holds the earlier counter; keep it.
    }

    /// Discards every state with `revision <= revision`, making those
    /// sessions irreversible.
    pub fn commit(&mut self, revision: u64) {
        self.states.retain(|s| s.revision > revision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> ObjectId {
        ObjectId::new(v)
    }

    #[test]
    fn modify_keeps_earliest_snapshot() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);

        stack.on_modify(id(1), &10);
        stack.on_modify(id(1), &20);

        let state = stack.pop().unwrap();
        assert_eq!(state.old_values[&id(1)], 10);
    }

    #[test]
    fn modify_of_created_object_records_nothing() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);

        stack.on_create(id(0));
        stack.on_modify(id(0), &10);

        let state = stack.pop().unwrap();
        assert!(state.old_values.is_empty());
        assert!(state.new_ids.contains(&id(0)));
    }

    #[test]
    fn remove_of_created_object_leaves_no_trace() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);

        stack.on_create(id(0));
        stack.on_remove(id(0), &10);

        let state = stack.pop().unwrap();
        assert!(state.new_ids.is_empty());
        assert!(state.removed_values.is_empty());
    }

    #[test]
    fn remove_after_modify_keeps_session_start_snapshot() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);

        stack.on_modify(id(1), &10);
        stack.on_remove(id(1), &20);

        let state = stack.pop().unwrap();
        assert!(state.old_values.is_empty());
        assert_eq!(state.removed_values[&id(1)], 10);
    }

    #[test]
    fn squash_folds_new_ids() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);
        stack.on_create(id(0));
        stack.start_undo(2, 1);
        stack.on_create(id(1));

        stack.squash();

        let state = stack.pop().unwrap();
        assert_eq!(state.revision, 1);
        assert!(state.new_ids.contains(&id(0)));
        assert!(state.new_ids.contains(&id(1)));
    }

    #[test]
    fn squash_prefers_earlier_snapshot() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 5);
        stack.on_modify(id(1), &10);
        stack.start_undo(2, 5);
        stack.on_modify(id(1), &20);

        stack.squash();

        let state = stack.pop().unwrap();
        assert_eq!(state.old_values[&id(1)], 10);
        assert_eq!(state.old_next_id, 5);
    }

    #[test]
    fn squash_drops_inner_remove_of_outer_create() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);
        stack.on_create(id(0));
        stack.start_undo(2, 1);
        stack.on_remove(id(0), &10);

        stack.squash();

        let state = stack.pop().unwrap();
        assert!(state.new_ids.is_empty());
        assert!(state.removed_values.is_empty());
    }

    #[test]
    fn squash_moves_outer_modify_to_removed_on_inner_remove() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);
        stack.on_modify(id(1), &10);
        stack.start_undo(2, 0);
        stack.on_remove(id(1), &20);

        stack.squash();

        let state = stack.pop().unwrap();
        assert!(state.old_values.is_empty());
        assert_eq!(state.removed_values[&id(1)], 10);
    }

    #[test]
    fn commit_discards_states_up_to_revision() {
        let mut stack: UndoStack<i32> = UndoStack::new();
        stack.start_undo(1, 0);
        stack.start_undo(2, 0);
        stack.start_undo(3, 0);

        stack.commit(2);

        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.revision(), 3);
    }
}
