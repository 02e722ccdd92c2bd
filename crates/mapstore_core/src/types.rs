//! Core type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of an object within its typed index.
///
/// Ids are assigned by the index's monotonic counter at `create` time and
/// never change for the lifetime of the object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Creates an object id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Identifier of a record within a dynamic index. Assigned from 1 upward.
pub type RecordId = u32;
