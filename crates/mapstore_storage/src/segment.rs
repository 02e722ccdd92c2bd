//! The mapped segment and its persistent allocator.
//!
//! On-disk layout of `shared_memory.bin`:
//!
//! ```text
//! 0     magic            8 bytes
//! 8     header crc32     4 bytes   (over bytes 16..1616)
//! 12    reserved         4 bytes
//! 16    fingerprint      32 bytes
//! 48    alloc_next       8 bytes   bump pointer
//! 56    free_head        8 bytes   first free block, 0 = none
//! 64    revision         8 bytes   database-wide undo revision
//! 72    reserved         8 bytes
//! 80    slot directory   64 x 24 bytes
//! 2048  data region      blocks
//! ```
//!
//! Every allocation is a block `[capacity: u64][payload]` addressed by the
//! offset of its payload. Freed blocks are threaded onto an intrusive free
//! list through their first payload word. Records are stored as cells in
//! per-slot doubly-linked chains `[prev][next][len][data]`, so a cell can be
//! unlinked in O(1) and the whole store can be rebuilt by walking chains.
//!
//! All links are segment offsets, never pointers; offset 0 (the magic) is
//! the null sentinel.

use crate::error::{StorageError, StorageResult};
use crate::fingerprint::{Fingerprint, FINGERPRINT_LEN};
use crate::mapping::{MappedFile, OpenMode};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MAGIC: [u8; 8] = *b"MAPSTOR\x01";

const OFF_MAGIC: u64 = 0;
const OFF_CRC: u64 = 8;
const OFF_FINGERPRINT: u64 = 16;
const OFF_ALLOC_NEXT: u64 = 48;
const OFF_FREE_HEAD: u64 = 56;
const OFF_REVISION: u64 = 64;
const OFF_DIRECTORY: u64 = 80;

/// Number of entries in the index-slot directory.
pub const MAX_INDEX_SLOTS: usize = 64;

const SLOT_SIZE: u64 = 24;
const HEADER_LEN: u64 = OFF_DIRECTORY + MAX_INDEX_SLOTS as u64 * SLOT_SIZE; // 1616
const DATA_START: u64 = 2048;

/// Smallest segment a read-write attach will create.
pub const MIN_SEGMENT_SIZE: u64 = 64 * 1024;

const MIN_ALLOC: u64 = 16;
const SPLIT_MIN: u64 = MIN_ALLOC + 8;

/// Cell header: prev (8) + next (8) + len (4).
const CELL_HEADER: u64 = 20;

/// Index of an entry in the slot directory.
pub type SlotId = usize;

/// The primary mapped segment: backing file, allocator and slot directory.
///
/// A read-write attach holds the exclusive advisory lock on the bin file
/// until the segment is dropped.
#[derive(Debug)]
pub struct Segment {
    map: MappedFile,
    dir: PathBuf,
}

impl Segment {
    /// Path of the primary segment file inside a database directory.
    #[must_use]
    pub fn bin_path(dir: &Path) -> PathBuf {
        dir.join("shared_memory.bin")
    }

    /// Path of the lock-bank meta file inside a database directory.
    #[must_use]
    pub fn meta_path(dir: &Path) -> PathBuf {
        dir.join("shared_memory.meta")
    }

    /// Attaches the segment under `dir`.
    ///
    /// Read-write: creates the directory and file as needed, grows the file
    /// when `size` exceeds the current length (never shrinks), formats a
    /// fresh header or verifies an existing one, and takes the exclusive
    /// file lock. Read-only: the file must exist; nothing is written.
    pub fn open(dir: &Path, mode: OpenMode, size: u64) -> StorageResult<Self> {
        let bin = Self::bin_path(dir);

        match mode {
            OpenMode::ReadOnly => {
                if !dir.exists() {
                    return Err(StorageError::NotFound {
                        path: dir.to_path_buf(),
                    });
                }
                let map = MappedFile::open_read_only(&bin)?;
                let segment = Self {
                    map,
                    dir: dir.to_path_buf(),
                };
                segment.check_header()?;
                debug!(dir = %dir.display(), "attached segment read-only");
                Ok(segment)
            }
            OpenMode::ReadWrite => {
                fs::create_dir_all(dir)?;
                let existed = bin.exists();
                if !existed && size == 0 {
                    return Err(StorageError::GrowFailed { requested: 0 });
                }
                let effective = if existed {
                    size
                } else {
                    size.max(MIN_SEGMENT_SIZE)
                };
                let map = MappedFile::open_read_write(&bin, effective, true)?;
                let mut segment = Self {
                    map,
                    dir: dir.to_path_buf(),
                };
                if existed {
                    segment.check_header()?;
                } else {
                    segment.format()?;
                    info!(dir = %dir.display(), size = effective, "created segment");
                }
                Ok(segment)
            }
        }
    }

    /// Returns the attach mode.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.map.mode()
    }

    /// Returns true when the attach permits mutation.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.map.mode().is_writable()
    }

    /// Returns the database directory this segment lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    /// Returns true if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Flushes dirty pages back to the backing file.
    pub fn flush(&self) -> StorageResult<()> {
        self.map.flush()
    }

    // ---- header -----------------------------------------------------------

    fn format(&mut self) -> StorageResult<()> {
        self.write_bytes(OFF_MAGIC, &MAGIC)?;
        let fp = Fingerprint::current().encode();
        self.write_bytes(OFF_FINGERPRINT, &fp)?;
        self.set_u64(OFF_ALLOC_NEXT, DATA_START)?;
        self.set_u64(OFF_FREE_HEAD, 0)?;
        self.set_u64(OFF_REVISION, 0)?;
        let zeros = vec![0u8; MAX_INDEX_SLOTS * SLOT_SIZE as usize];
        self.write_bytes(OFF_DIRECTORY, &zeros)?;
        self.refresh_header_crc()
    }

    fn check_header(&self) -> StorageResult<()> {
        if self.map.len() < DATA_START {
            return Err(StorageError::HeaderCorrupted("file too short".into()));
        }
        if self.bytes(OFF_MAGIC, 8)? != MAGIC {
            return Err(StorageError::HeaderCorrupted("bad magic".into()));
        }
        let stored = self.u32_at(OFF_CRC)?;
        let actual = crc32fast::hash(self.bytes(OFF_FINGERPRINT, (HEADER_LEN - OFF_FINGERPRINT) as usize)?);
        if stored != actual {
            return Err(StorageError::HeaderCorrupted(format!(
                "header checksum mismatch: stored {stored:08x}, computed {actual:08x}"
            )));
        }
        let mut fp = [0u8; FINGERPRINT_LEN];
        fp.copy_from_slice(self.bytes(OFF_FINGERPRINT, FINGERPRINT_LEN)?);
        Fingerprint::verify(&fp)
    }

    fn refresh_header_crc(&mut self) -> StorageResult<()> {
        let crc = crc32fast::hash(self.bytes(OFF_FINGERPRINT, (HEADER_LEN - OFF_FINGERPRINT) as usize)?);
        self.set_u32(OFF_CRC, crc)
    }

    /// Returns the database-wide undo revision stored in the header.
    pub fn revision(&self) -> StorageResult<u64> {
        self.u64_at(OFF_REVISION)
    }

    /// Persists the database-wide undo revision.
    pub fn set_revision(&mut self, revision: u64) -> StorageResult<()> {
        self.set_u64(OFF_REVISION, revision)?;
        self.refresh_header_crc()
    }

    // ---- slot directory ---------------------------------------------------

    fn slot_off(slot: SlotId) -> u64 {
        OFF_DIRECTORY + slot as u64 * SLOT_SIZE
    }

    /// Finds the directory slot registered under `tag`.
    #[must_use]
    pub fn find_slot(&self, tag: u32) -> Option<SlotId> {
        (0..MAX_INDEX_SLOTS).find(|&i| {
            let off = Self::slot_off(i);
            self.u32_at(off + 4).ok() == Some(1) && self.u32_at(off).ok() == Some(tag)
        })
    }

    /// Returns the slot registered under `tag`, claiming a vacant one if
    /// absent. Fails with `DirectoryFull` when no slot is left.
    pub fn register_slot(&mut self, tag: u32) -> StorageResult<SlotId> {
        if let Some(slot) = self.find_slot(tag) {
            return Ok(slot);
        }
        let slot = (0..MAX_INDEX_SLOTS)
            .find(|&i| self.u32_at(Self::slot_off(i) + 4).ok() == Some(0))
            .ok_or(StorageError::DirectoryFull {
                max: MAX_INDEX_SLOTS,
            })?;
        let off = Self::slot_off(slot);
        self.set_u32(off, tag)?;
        self.set_u32(off + 4, 1)?;
        self.set_u64(off + 8, 0)?; // next_id
        self.set_u64(off + 16, 0)?; // chain head
        self.refresh_header_crc()?;
        debug!(tag, slot, "registered index slot");
        Ok(slot)
    }

    /// Reads a slot's persisted id counter.
    pub fn slot_next_id(&self, slot: SlotId) -> StorageResult<u64> {
        self.u64_at(Self::slot_off(slot) + 8)
    }

    /// Persists a slot's id counter.
    pub fn set_slot_next_id(&mut self, slot: SlotId, next_id: u64) -> StorageResult<()> {
        self.set_u64(Self::slot_off(slot) + 8, next_id)?;
        self.refresh_header_crc()
    }

    fn slot_head(&self, slot: SlotId) -> StorageResult<u64> {
        self.u64_at(Self::slot_off(slot) + 16)
    }

    fn set_slot_head(&mut self, slot: SlotId, head: u64) -> StorageResult<()> {
        self.set_u64(Self::slot_off(slot) + 16, head)
    }

    // ---- cell chains ------------------------------------------------------

    /// Allocates a cell holding `payload` and links it at the head of the
    /// slot's chain. Returns the cell offset.
    pub fn chain_push(&mut self, slot: SlotId, payload: &[u8]) -> StorageResult<u64> {
        let cell = self.alloc(CELL_HEADER + payload.len() as u64)?;
        let head = self.slot_head(slot)?;
        self.set_u64(cell, 0)?; // prev
        self.set_u64(cell + 8, head)?; // next
        self.set_u32(cell + 16, payload.len() as u32)?;
        self.write_bytes(cell + CELL_HEADER, payload)?;
        if head != 0 {
            self.set_u64(head, cell)?;
        }
        self.set_slot_head(slot, cell)?;
        self.refresh_header_crc()?;
        Ok(cell)
    }

    /// Unlinks a cell from its chain and frees its block.
    pub fn chain_remove(&mut self, slot: SlotId, cell: u64) -> StorageResult<()> {
        let prev = self.u64_at(cell)?;
        let next = self.u64_at(cell + 8)?;
        if prev == 0 {
            self.set_slot_head(slot, next)?;
        } else {
            self.set_u64(prev + 8, next)?;
        }
        if next != 0 {
            self.set_u64(next, prev)?;
        }
        self.free(cell)?;
        self.refresh_header_crc()
    }

    /// Rewrites a cell's payload, in place when its block has capacity,
    /// otherwise by relocating the cell. Returns the (possibly new) offset.
    pub fn chain_update(&mut self, slot: SlotId, cell: u64, payload: &[u8]) -> StorageResult<u64> {
        if self.block_capacity(cell)? >= CELL_HEADER + payload.len() as u64 {
            self.set_u32(cell + 16, payload.len() as u32)?;
            self.write_bytes(cell + CELL_HEADER, payload)?;
            Ok(cell)
        } else {
            self.chain_remove(slot, cell)?;
            self.chain_push(slot, payload)
        }
    }

    /// Walks a slot's chain, returning `(cell, payload)` for every cell.
    pub fn chain_cells(&self, slot: SlotId) -> StorageResult<Vec<(u64, Vec<u8>)>> {
        let mut cells = Vec::new();
        let mut cursor = self.slot_head(slot)?;
        while cursor != 0 {
            let len = self.u32_at(cursor + 16)? as usize;
            let payload = self.bytes(cursor + CELL_HEADER, len)?.to_vec();
            cells.push((cursor, payload));
            cursor = self.u64_at(cursor + 8)?;
        }
        Ok(cells)
    }

    // ---- allocator --------------------------------------------------------

    fn alloc(&mut self, len: u64) -> StorageResult<u64> {
        let need = len.max(MIN_ALLOC);

        // First fit from the free list.
        let mut prev: Option<u64> = None;
        let mut cursor = self.u64_at(OFF_FREE_HEAD)?;
        while cursor != 0 {
            let cap = self.u64_at(cursor - 8)?;
            let next_free = self.u64_at(cursor)?;
            if cap >= need {
                match prev {
                    None => self.set_u64(OFF_FREE_HEAD, next_free)?,
                    Some(p) => self.set_u64(p, next_free)?,
                }
                if cap - need >= SPLIT_MIN {
                    let remainder = cursor + need + 8;
                    self.set_u64(remainder - 8, cap - need - 8)?;
                    self.free(remainder)?;
                    self.set_u64(cursor - 8, need)?;
                }
                return Ok(cursor);
            }
            prev = Some(cursor);
            cursor = next_free;
        }

        // Bump allocation.
        let block = self.u64_at(OFF_ALLOC_NEXT)?;
        let total = 8 + need;
        if block + total > self.map.len() {
            return Err(StorageError::SegmentFull { requested: need });
        }
        self.set_u64(OFF_ALLOC_NEXT, block + total)?;
        self.set_u64(block, need)?;
        Ok(block + 8)
    }

    fn free(&mut self, payload: u64) -> StorageResult<()> {
        let head = self.u64_at(OFF_FREE_HEAD)?;
        self.set_u64(payload, head)?;
        self.set_u64(OFF_FREE_HEAD, payload)
    }

    fn block_capacity(&self, payload: u64) -> StorageResult<u64> {
        self.u64_at(payload - 8)
    }

    // ---- raw access -------------------------------------------------------

    fn bytes(&self, off: u64, len: usize) -> StorageResult<&[u8]> {
        let end = off + len as u64;
        if end > self.map.len() {
            return Err(StorageError::HeaderCorrupted(format!(
                "offset {off} + {len} past end of segment"
            )));
        }
        Ok(&self.map.as_slice()[off as usize..end as usize])
    }

    fn write_bytes(&mut self, off: u64, data: &[u8]) -> StorageResult<()> {
        let end = off + data.len() as u64;
        if end > self.map.len() {
            return Err(StorageError::HeaderCorrupted(format!(
                "offset {off} + {} past end of segment",
                data.len()
            )));
        }
        self.map.as_mut_slice()?[off as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn u64_at(&self, off: u64) -> StorageResult<u64> {
        let b = self.bytes(off, 8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    fn set_u64(&mut self, off: u64, v: u64) -> StorageResult<()> {
        self.write_bytes(off, &v.to_le_bytes())
    }

    fn u32_at(&self, off: u64) -> StorageResult<u32> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4-byte slice")))
    }

    fn set_u32(&mut self, off: u64, v: u32) -> StorageResult<()> {
        self.write_bytes(off, &v.to_le_bytes())
    }
}
