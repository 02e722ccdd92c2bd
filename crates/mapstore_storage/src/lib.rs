//! # mapstore Storage
//!
//! Mapped-file primitives for the mapstore object store.
//!
//! This crate owns everything that touches raw bytes of the backing files:
//!
//! - [`Fingerprint`] - the environment record written into a segment at
//!   create time and verified on every open
//! - [`Segment`] - the memory-mapped `shared_memory.bin` file with its
//!   in-segment allocator, index-slot directory and cell chains
//! - [`LockBank`] - the bank of inter-process read/write locks stored in
//!   `shared_memory.meta`
//!
//! ## Design Principles
//!
//! - Everything inside a segment is addressed by **offsets from the segment
//!   base**, never by process pointers, so a file survives remapping at a
//!   different address and reattach by another process.
//! - The lock bank lives in a separate mapping so that a crash while writing
//!   the main segment cannot corrupt lock state.
//! - Higher layers (`mapstore_core`) own all record interpretation; this
//!   crate stores opaque payload bytes.

#![warn(missing_docs)]

mod error;
mod fingerprint;
mod lockbank;
mod mapping;
mod segment;

pub use error::{StorageError, StorageResult};
pub use fingerprint::{Fingerprint, FINGERPRINT_LEN, LAYOUT_VERSION};
pub use lockbank::{LockBank, NUM_RW_LOCKS};
pub use mapping::OpenMode;
pub use segment::{Segment, SlotId, MAX_INDEX_SLOTS, MIN_SEGMENT_SIZE};
