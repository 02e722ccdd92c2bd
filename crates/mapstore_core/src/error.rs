//! Error types for store operations.

use mapstore_storage::StorageError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the typed and dynamic store layers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error from the mapping / segment / lock-bank layer.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Object payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The index type was registered twice on the same handle.
    #[error("index {name} already registered")]
    AlreadyRegistered {
        /// The index type name.
        name: &'static str,
    },

    /// A read-only attach referenced an index that does not exist in the
    /// segment.
    #[error("index {name} not found in read-only database")]
    IndexNotFound {
        /// The index (or subsystem) name.
        name: String,
    },

    /// A mutation was attempted through a read-only attach.
    #[error("database is not writable")]
    NotWritable,

    /// Insert or re-key would violate a uniqueness constraint.
    #[error("could not insert object: uniqueness constraint violated on {index}")]
    Uniqueness {
        /// The ordering whose constraint was violated.
        index: String,
    },

    /// `get` was called with an id that is not present.
    #[error("no object with id {id} in index {index}")]
    OutOfRange {
        /// The missing id.
        id: u64,
        /// The index name.
        index: String,
    },

    /// A secondary-key `get_by` lookup found no object for the key.
    #[error("no object with matching key in index {index}")]
    KeyNotFound {
        /// The ordering that was searched.
        index: String,
    },

    /// A `get_by` lookup found no record for the key.
    #[error("unable to find record by {key} key in table {table}")]
    RecordNotFound {
        /// Which key form was queried (`id`, `primary`, `secondary`).
        key: &'static str,
        /// The table name.
        table: String,
    },

    /// A named dynamic database does not exist.
    #[error("unable to find database with name {name}")]
    DatabaseNotFound {
        /// The database name.
        name: String,
    },

    /// A named table does not exist in its dynamic database.
    #[error("unable to find table with name {name}")]
    TableNotFound {
        /// The table name.
        name: String,
    },

    /// A database or table with this name already exists.
    #[error("{kind} named {name} already exists")]
    AlreadyExists {
        /// What kind of entity collided (`database`, `table`).
        kind: &'static str,
        /// The colliding name.
        name: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The handle was closed.
    #[error("database is closed")]
    Closed,
}

impl StoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a uniqueness violation error.
    pub fn uniqueness(index: impl Into<String>) -> Self {
        Self::Uniqueness {
            index: index.into(),
        }
    }
}
