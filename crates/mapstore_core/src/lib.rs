//! # mapstore Core
//!
//! An embedded, transactional, in-process object store whose working set
//! lives in a memory-mapped file.
//!
//! This crate provides:
//! - Typed indices: multi-ordered collections of one object type with a
//!   unique id ordering and any number of secondary orderings
//! - Undo sessions: scoped handles that capture enough prior state to
//!   revert any sequence of creates, modifies and removes
//! - The static [`Database`] facade over statically registered indices
//! - The dynamic variant ([`MultiDatabase`]): named databases of named
//!   tables whose records are created at runtime, no recompilation needed
//!
//! Mapping, allocation and inter-process locking live in
//! [`mapstore_storage`]; this crate owns all record interpretation and the
//! transactional semantics on top.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod database;
mod dynamic;
mod error;
mod index;
mod object;
mod options;
mod session;
mod types;
mod undo;

pub use database::Database;
pub use dynamic::{ComparisonKind, DatabaseHandle, DatabaseInfo, MultiDatabase, Record};
pub use error::{StoreError, StoreResult};
pub use object::{IndexKey, SecondaryKeyDef, StoreObject};
pub use options::StoreOptions;
pub use session::Session;
pub use types::{ObjectId, RecordId};

pub use mapstore_storage::{OpenMode, StorageError, NUM_RW_LOCKS};
