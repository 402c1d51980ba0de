//! # Undo Log Allocator
//!
//! Lifecycle management for undo logs: handing out exclusively-owned log
//! slots per persistence level, extending physical backing ahead of
//! insertions, retiring logs that fill up, and persisting slot metadata
//! across restarts.
//!
//! ## Slot Ownership
//!
//! A slot is exclusively owned from [`UndoLogManager::get_for_persistence`]
//! until [`UndoLogManager::put`]. While owned, only the owning backend
//! advances `insert`; other backends may still read the metadata (the
//! discard worker advances `discard`, checkpoints read everything), which
//! is why the metadata sits behind a reader/writer lock.
//!
//! ## Metadata Durability
//!
//! `insert`/`discard` positions are written to `undo/meta` by
//! [`UndoLogManager::checkpoint`] and reloaded on open. Between
//! checkpoints the WAL is authoritative; replay recreates slots it finds
//! referenced by undo blocks.

use std::fs;
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::little_endian::{U32, U64};

use crate::config::{BLCKSZ, UNDO_PAGE_HEADER_SIZE};
use crate::log::address::{block_of, UndoLogNumber, UndoLogOffset};
use crate::log::files::UndoFileSet;

/// Durability class of an undo log and of the record sets stored in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Persistence {
    Permanent,
    Unlogged,
    Temp,
}

impl Persistence {
    fn index(self) -> usize {
        match self {
            Persistence::Permanent => 0,
            Persistence::Unlogged => 1,
            Persistence::Temp => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Persistence::Permanent),
            1 => Ok(Persistence::Unlogged),
            2 => Ok(Persistence::Temp),
            other => bail!("unknown persistence level {}", other),
        }
    }
}

/// Mutable state of one undo log, guarded by the slot's metadata lock.
#[derive(Debug, Clone, Copy)]
pub struct UndoLogMeta {
    /// Location of the next insert (head).
    pub insert: UndoLogOffset,
    /// Oldest byte still needed (tail).
    pub discard: UndoLogOffset,
    /// One past the end of the physically backed range.
    pub end: UndoLogOffset,
    /// Insert cap; once `insert` cannot advance within it the log is full.
    pub size: UndoLogOffset,
    /// Full logs are retired instead of returned to the freelist.
    pub full: bool,
}

/// The in-memory control object for one undo log.
pub struct UndoLogSlot {
    logno: UndoLogNumber,
    persistence: Persistence,
    meta: RwLock<UndoLogMeta>,
}

impl UndoLogSlot {
    pub fn logno(&self) -> UndoLogNumber {
        self.logno
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// The metadata lock. Readers of `insert`/`end`/`discard` take it
    /// shared; the insert-pointer update takes it exclusive.
    pub fn meta(&self) -> &RwLock<UndoLogMeta> {
        &self.meta
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MetaFileHeader {
    magic: U32,
    slot_count: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MetaFileEntry {
    logno: U32,
    persistence: u8,
    full: u8,
    _reserved: [u8; 2],
    insert: U64,
    discard: U64,
    end: U64,
    size: U64,
}

const META_MAGIC: u32 = 0x554E_444C; // "UNDL"
const META_FILE_NAME: &str = "meta";

struct LogTable {
    slots: HashMap<UndoLogNumber, Arc<UndoLogSlot>>,
    free: [Vec<UndoLogNumber>; 3],
    next_logno: UndoLogNumber,
}

/// Allocates and tracks undo log slots.
pub struct UndoLogManager {
    files: Arc<UndoFileSet>,
    table: Mutex<LogTable>,
    log_size: u64,
}

impl UndoLogManager {
    /// Opens the manager over an engine directory, reloading any slot
    /// metadata written by a previous checkpoint. Logs whose metadata was
    /// never checkpointed are reconstructed by WAL replay instead.
    pub fn open(files: Arc<UndoFileSet>, log_size: u64) -> Result<Self> {
        let mut table = LogTable {
            slots: HashMap::new(),
            free: [Vec::new(), Vec::new(), Vec::new()],
            next_logno: 1,
        };

        let meta_path = Self::meta_path(&files);
        if meta_path.exists() {
            let bytes = fs::read(&meta_path)
                .wrap_err_with(|| format!("failed to read undo metadata at {:?}", meta_path))?;
            load_meta(&bytes, &mut table)?;
        }

        // Never hand out a log number whose file already exists, even if
        // its metadata was lost in a crash; replay will rebuild the slot.
        if let Some(max) = files.known_logs().last() {
            table.next_logno = table.next_logno.max(max + 1);
        }

        Ok(Self {
            files,
            table: Mutex::new(table),
            log_size,
        })
    }

    fn meta_path(files: &UndoFileSet) -> PathBuf {
        files.base_dir().join("undo").join(META_FILE_NAME)
    }

    /// Takes exclusive ownership of a log with room to insert, reusing a
    /// free slot when one exists and creating a fresh log otherwise.
    pub fn get_for_persistence(&self, persistence: Persistence) -> Result<Arc<UndoLogSlot>> {
        let mut table = self.table.lock();
        if let Some(logno) = table.free[persistence.index()].pop() {
            let slot = table.slots.get(&logno).expect("freelist names unknown slot");
            return Ok(Arc::clone(slot));
        }

        let logno = table.next_logno;
        table.next_logno += 1;
        self.files.create(logno)?;

        let slot = Arc::new(UndoLogSlot {
            logno,
            persistence,
            meta: RwLock::new(UndoLogMeta {
                insert: UNDO_PAGE_HEADER_SIZE as u64,
                discard: UNDO_PAGE_HEADER_SIZE as u64,
                end: 0,
                size: self.log_size,
                full: false,
            }),
        });
        table.slots.insert(logno, Arc::clone(&slot));
        Ok(slot)
    }

    /// Returns an owned slot. Full logs are retired; others become
    /// available for reuse.
    pub fn put(&self, slot: &Arc<UndoLogSlot>) {
        let full = slot.meta.read().full;
        if full {
            return;
        }
        let mut table = self.table.lock();
        let free = &mut table.free[slot.persistence.index()];
        if !free.contains(&slot.logno) {
            free.push(slot.logno);
        }
    }

    /// Marks a log full so no further insertions are attempted in it.
    pub fn mark_full(&self, slot: &UndoLogSlot) {
        slot.meta.write().full = true;
    }

    /// Extends the physical backing of `logno` so that it covers
    /// `new_end` bytes, in whole segments. Concurrent extension is
    /// harmless: the file only ever grows. The advertised `end` never
    /// passes the log's insert cap, even though the file is
    /// segment-aligned.
    pub fn adjust_physical_range(&self, logno: UndoLogNumber, new_end: UndoLogOffset) -> Result<()> {
        let slot = self
            .get_slot(logno)
            .ok_or_else(|| eyre::eyre!("undo log {} has no slot", logno))?;
        let blocks = block_of(new_end.saturating_add(BLCKSZ as u64 - 1));
        let backed = self.files.ensure_blocks(logno, blocks)?;
        let mut meta = slot.meta.write();
        let backed_bytes = (backed as u64 * BLCKSZ as u64).min(meta.size);
        meta.end = meta.end.max(backed_bytes);
        Ok(())
    }

    pub fn get_slot(&self, logno: UndoLogNumber) -> Option<Arc<UndoLogSlot>> {
        self.table.lock().slots.get(&logno).map(Arc::clone)
    }

    /// Resolves a slot during replay, creating one for a log the WAL
    /// references but this instance has never seen.
    pub fn get_or_create_slot(
        &self,
        logno: UndoLogNumber,
        persistence: Persistence,
    ) -> Result<Arc<UndoLogSlot>> {
        let mut table = self.table.lock();
        if let Some(slot) = table.slots.get(&logno) {
            return Ok(Arc::clone(slot));
        }
        if self.files.blocks(logno) == 0 && !self.files.known_logs().contains(&logno) {
            self.files.create(logno)?;
        }
        let end = self.files.blocks(logno) as u64 * BLCKSZ as u64;
        let slot = Arc::new(UndoLogSlot {
            logno,
            persistence,
            meta: RwLock::new(UndoLogMeta {
                insert: UNDO_PAGE_HEADER_SIZE as u64,
                discard: UNDO_PAGE_HEADER_SIZE as u64,
                end,
                size: self.log_size,
                full: false,
            }),
        });
        table.slots.insert(logno, Arc::clone(&slot));
        table.next_logno = table.next_logno.max(logno + 1);
        Ok(slot)
    }

    /// All live slots, in log-number order.
    pub fn all_slots(&self) -> Vec<Arc<UndoLogSlot>> {
        let table = self.table.lock();
        let mut slots: Vec<_> = table.slots.values().map(Arc::clone).collect();
        slots.sort_unstable_by_key(|s| s.logno);
        slots
    }

    /// Advances the discard pointer of a log. Data below the discard
    /// pointer is no longer addressable.
    pub fn advance_discard(&self, logno: UndoLogNumber, new_discard: UndoLogOffset) -> Result<()> {
        let slot = self
            .get_slot(logno)
            .ok_or_else(|| eyre::eyre!("undo log {} has no slot", logno))?;
        let mut meta = slot.meta.write();
        ensure!(
            new_discard >= meta.discard && new_discard <= meta.insert,
            "discard pointer for undo log {} may only advance (current {}, requested {})",
            logno,
            meta.discard,
            new_discard
        );
        meta.discard = new_discard;
        Ok(())
    }

    /// Makes every non-full, unreferenced slot available again. Called
    /// once crash recovery has closed dangling chunks.
    pub fn rebuild_freelists(&self) {
        let mut table = self.table.lock();
        let candidates: Vec<(usize, UndoLogNumber)> = table
            .slots
            .values()
            .filter(|slot| !slot.meta.read().full)
            .map(|slot| (slot.persistence.index(), slot.logno))
            .collect();
        for (index, logno) in candidates {
            if !table.free[index].contains(&logno) {
                table.free[index].push(logno);
            }
        }
    }

    /// Persists slot metadata so a restart can pick up where this
    /// instance left off.
    pub fn checkpoint(&self) -> Result<()> {
        let table = self.table.lock();
        let mut slots: Vec<_> = table.slots.values().collect();
        slots.sort_unstable_by_key(|s| s.logno);

        let header = MetaFileHeader {
            magic: U32::new(META_MAGIC),
            slot_count: U32::new(slots.len() as u32),
        };
        let mut bytes = Vec::with_capacity(
            size_of::<MetaFileHeader>() + slots.len() * size_of::<MetaFileEntry>(),
        );
        bytes.extend_from_slice(header.as_bytes());
        for slot in slots {
            let meta = slot.meta.read();
            let entry = MetaFileEntry {
                logno: U32::new(slot.logno),
                persistence: slot.persistence.index() as u8,
                full: meta.full as u8,
                _reserved: [0; 2],
                insert: U64::new(meta.insert),
                discard: U64::new(meta.discard),
                end: U64::new(meta.end),
                size: U64::new(meta.size),
            };
            bytes.extend_from_slice(entry.as_bytes());
        }

        let path = Self::meta_path(&self.files);
        fs::write(&path, &bytes)
            .wrap_err_with(|| format!("failed to write undo metadata at {:?}", path))?;
        Ok(())
    }
}

fn load_meta(bytes: &[u8], table: &mut LogTable) -> Result<()> {
    let header_size = size_of::<MetaFileHeader>();
    ensure!(bytes.len() >= header_size, "undo metadata file truncated");
    let header = MetaFileHeader::ref_from_bytes(&bytes[..header_size])
        .map_err(|e| eyre::eyre!("invalid undo metadata header: {:?}", e))?;
    ensure!(
        header.magic.get() == META_MAGIC,
        "undo metadata has wrong magic {:#X}",
        header.magic.get()
    );

    let entry_size = size_of::<MetaFileEntry>();
    let count = header.slot_count.get() as usize;
    ensure!(
        bytes.len() >= header_size + count * entry_size,
        "undo metadata file truncated: {} slots declared",
        count
    );

    for i in 0..count {
        let start = header_size + i * entry_size;
        let entry = MetaFileEntry::ref_from_bytes(&bytes[start..start + entry_size])
            .map_err(|e| eyre::eyre!("invalid undo metadata entry: {:?}", e))?;
        let persistence = Persistence::from_u8(entry.persistence)?;
        let logno = entry.logno.get();
        let full = entry.full != 0;
        let slot = Arc::new(UndoLogSlot {
            logno,
            persistence,
            meta: RwLock::new(UndoLogMeta {
                insert: entry.insert.get(),
                discard: entry.discard.get(),
                end: entry.end.get(),
                size: entry.size.get(),
                full,
            }),
        });
        table.slots.insert(logno, slot);
        table.next_logno = table.next_logno.max(logno + 1);
        if !full {
            table.free[persistence.index()].push(logno);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> UndoLogManager {
        let files = Arc::new(UndoFileSet::open(dir).unwrap());
        UndoLogManager::open(files, crate::config::UNDO_LOG_MAX_SIZE).unwrap()
    }

    #[test]
    fn fresh_slot_starts_after_page_header() {
        let dir = tempdir().unwrap();
        let logs = manager(dir.path());
        let slot = logs.get_for_persistence(Persistence::Permanent).unwrap();
        let meta = slot.meta().read();
        assert_eq!(meta.insert, UNDO_PAGE_HEADER_SIZE as u64);
        assert_eq!(meta.discard, meta.insert);
        assert_eq!(meta.end, 0);
    }

    #[test]
    fn put_recycles_slot() {
        let dir = tempdir().unwrap();
        let logs = manager(dir.path());
        let slot = logs.get_for_persistence(Persistence::Permanent).unwrap();
        let logno = slot.logno();
        logs.put(&slot);
        let again = logs.get_for_persistence(Persistence::Permanent).unwrap();
        assert_eq!(again.logno(), logno);
    }

    #[test]
    fn full_slot_is_retired() {
        let dir = tempdir().unwrap();
        let logs = manager(dir.path());
        let slot = logs.get_for_persistence(Persistence::Permanent).unwrap();
        logs.mark_full(&slot);
        logs.put(&slot);
        let next = logs.get_for_persistence(Persistence::Permanent).unwrap();
        assert_ne!(next.logno(), slot.logno());
    }

    #[test]
    fn adjust_physical_range_extends_in_segments() {
        let dir = tempdir().unwrap();
        let logs = manager(dir.path());
        let slot = logs.get_for_persistence(Persistence::Permanent).unwrap();
        logs.adjust_physical_range(slot.logno(), BLCKSZ as u64 * 3).unwrap();
        let end = slot.meta().read().end;
        assert_eq!(end, crate::config::UNDO_SEGMENT_SIZE as u64);
    }

    #[test]
    fn checkpoint_roundtrips_meta() {
        let dir = tempdir().unwrap();
        let logno;
        {
            let logs = manager(dir.path());
            let slot = logs.get_for_persistence(Persistence::Permanent).unwrap();
            logno = slot.logno();
            slot.meta().write().insert = 5000;
            logs.checkpoint().unwrap();
        }
        let logs = manager(dir.path());
        let slot = logs.get_slot(logno).unwrap();
        assert_eq!(slot.meta().read().insert, 5000);
        assert_eq!(slot.persistence(), Persistence::Permanent);
    }
}
