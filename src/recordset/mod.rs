//! # Undo Record Sets
//!
//! An undo record set (URS) groups related undo records — typically all
//! the undo written by one transaction at one persistence level — into a
//! durable sequence of byte ranges inside append-only undo logs. A set is
//! made of *chunks*: contiguous ranges, each introduced by a chunk
//! header, chained backwards through `previous_chunk` pointers when a log
//! fills up and the set spills into a fresh one. The first chunk
//! additionally carries a type header identifying the set to its
//! consumer.
//!
//! ## Write Protocol
//!
//! ```text
//! prepare_insert(size)   reserve space, pin pages, then lock them
//!        │                (may open a new chunk in a new log and queue
//!        │                 a close of the previous one)
//!        ▼
//! insert(record)         critical section: stamp headers, copy bytes,
//!        │                advance the shared insert pointer, stage
//!        │                per-buffer WAL instructions
//!        ▼
//! register_wal_buffers   attach pinned buffers + instructions to the
//!        │                caller's WAL record
//!        ▼
//! wal.insert(...)        caller emits the record
//!        ▼
//! set_lsn / release      stamp the record LSN, unlock, unpin
//! ```
//!
//! `prepare_insert` does all allocation, I/O, and lock acquisition; the
//! operations between it and `release` cannot fail and never allocate
//! buffer-manager resources, which is what makes the sequence safe to run
//! inside a critical section. Pins are taken for the whole range first
//! and content locks acquired in a second pass, so no lock is ever held
//! across a page read.
//!
//! ## Close Protocol
//!
//! Closing patches the final chunk's `size` field (0 while open) in
//! place. The 8-byte patch may straddle a page boundary, in which case
//! two buffers are pinned and two overwrites performed. The close is
//! attached to whatever WAL record the caller is building; when a
//! transaction level ends without one, [`UndoEngine::close_and_destroy_for_level`]
//! emits a no-op record to carry it.
//!
//! ## States
//!
//! A set moves `Clean -> Dirty` on first insert and `Dirty -> Closed` on
//! `mark_closed`. Destroying a `Dirty` set loses the close forever, so it
//! is a panic; destroying `Clean` or `Closed` sets is normal. A set left
//! dangling by a crash is closed at startup by
//! [`recovery::close_dangling_sets`].

pub mod recovery;
pub mod replay;

use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::buffer::{BufferManager, BufferTag, Frame, PageWriteGuard, ReadMode};
use crate::config::{
    BLCKSZ, EngineConfig, MAX_TYPE_HEADER_SIZE, NOOP_FILLER_SIZE, UNDO_CHUNK_HEADER_SIZE,
    UNDO_PAGE_HEADER_SIZE,
};
use crate::log::{
    block_of, offset_plus_usable_bytes, page_offset_of, Persistence, UndoFileSet, UndoLogManager,
    UndoLogNumber, UndoLogOffset, UndoLogSlot, UndoRecPtr,
};
use crate::page::{ChunkHeader, UndoPageMut};
use crate::wal::bufdata::{
    UndoBufData, URS_XLOG_ADD_CHUNK, URS_XLOG_ADD_PAGE, URS_XLOG_CLOSE, URS_XLOG_CLOSE_CHUNK,
    URS_XLOG_CLOSE_MULTI_CHUNK, URS_XLOG_CREATE, URS_XLOG_INSERT,
};
use crate::wal::{Lsn, Wal, WalRecordBuilder, REGBUF_WILL_INIT, RM_XLOG, XLOG_NOOP};
use crate::xact::{UndoSetType, XactUndoHook};
use zerocopy::IntoBytes;

const BUF_IS_NEW: u8 = 0x01;
const BUF_NEEDS_INIT: u8 = 0x02;
const BUF_NEEDS_DIRTY: u8 = 0x04;
const BUF_NEEDS_WAL: u8 = 0x08;

/// Stable handle to a live record set within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UrsId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrsState {
    Clean,
    Dirty,
    Closed,
}

struct Chunk {
    slot: Arc<UndoLogSlot>,
    header_offset: UndoLogOffset,
    header_written: bool,
    header_buffer_index: [Option<usize>; 2],
}

struct SetBuffer {
    frame: Arc<Frame>,
    guard: Option<PageWriteGuard>,
    flags: u8,
    bufdata: UndoBufData,
}

struct UndoRecordSet {
    set_type: UndoSetType,
    persistence: Persistence,
    nesting_level: u32,
    state: UrsState,

    chunks: SmallVec<[Chunk; 2]>,

    buffers: SmallVec<[SetBuffer; 4]>,

    /// Active slot for insertion; `None` until the first chunk exists or
    /// after the current log filled up.
    slot: Option<Arc<UndoLogSlot>>,
    recent_end: UndoLogOffset,

    /// Planner outputs for the in-progress insertion.
    begin: UndoRecPtr,
    pending_size: usize,
    need_chunk_header: bool,
    need_type_header: bool,
    chunk_to_close: Option<usize>,

    type_header: SmallVec<[u8; MAX_TYPE_HEADER_SIZE]>,
}

/// Services shared by every backend of one undo installation: the log
/// allocator, the buffer manager, the WAL, and the transaction undo
/// layer's close callback.
pub struct UndoShared {
    logs: UndoLogManager,
    buffers: BufferManager,
    wal: Wal,
    hook: Option<Arc<dyn XactUndoHook>>,
}

impl UndoShared {
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        Self::open_with_hook(config, None)
    }

    pub fn open_with_hook(
        config: EngineConfig,
        hook: Option<Arc<dyn XactUndoHook>>,
    ) -> Result<Arc<Self>> {
        let files = Arc::new(UndoFileSet::open(&config.dir)?);
        let logs = UndoLogManager::open(Arc::clone(&files), config.log_size)?;
        let buffers = BufferManager::new(Arc::clone(&files));
        let wal = Wal::open(&config.dir, config.full_page_images)?;
        Ok(Arc::new(Self {
            logs,
            buffers,
            wal,
            hook,
        }))
    }

    pub fn logs(&self) -> &UndoLogManager {
        &self.logs
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn hook(&self) -> Option<&Arc<dyn XactUndoHook>> {
        self.hook.as_ref()
    }

    /// Flushes dirty pages and persists undo log metadata.
    pub fn checkpoint(&self) -> Result<()> {
        self.buffers.flush()?;
        self.logs.checkpoint()
    }

    /// Reads `len` usable bytes starting at `start`, hopping page
    /// headers. This is how consumers scan a set's chunks and records
    /// back out of the log.
    pub fn read_bytes(&self, start: UndoRecPtr, len: usize) -> Result<Vec<u8>> {
        let logno = start.logno();
        let mut offset = start.offset();
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let page_offset = page_offset_of(offset);
            debug_assert!(page_offset >= UNDO_PAGE_HEADER_SIZE);
            let n = (BLCKSZ - page_offset).min(len - out.len());
            let frame = self
                .buffers
                .read_buffer(BufferTag::new(logno, block_of(offset)), ReadMode::Normal)?;
            frame.with_page(|page| out.extend_from_slice(&page[page_offset..page_offset + n]));
            offset = offset_plus_usable_bytes(offset, n);
        }
        Ok(out)
    }
}

/// One backend's view of the undo engine: its live record sets plus the
/// shared services. Engine methods are the public operations; everything
/// between a `prepare_*` call and `release` is infallible by
/// construction.
pub struct UndoEngine {
    shared: Arc<UndoShared>,
    live: HashMap<UrsId, UndoRecordSet>,
    next_id: u64,
}

impl UndoEngine {
    pub fn new(shared: Arc<UndoShared>) -> Self {
        Self {
            shared,
            live: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn shared(&self) -> &Arc<UndoShared> {
        &self.shared
    }

    /// Creates a new record set. It must eventually be closed and
    /// destroyed; sets with `nesting_level > 0` are picked up by the
    /// `*_for_level` operations when their transaction level ends.
    pub fn create(
        &mut self,
        set_type: UndoSetType,
        persistence: Persistence,
        nesting_level: u32,
        type_header: &[u8],
    ) -> Result<UrsId> {
        ensure!(
            type_header.len() == set_type.type_header_size(),
            "type header for {:?} must be {} bytes, got {}",
            set_type,
            set_type.type_header_size(),
            type_header.len()
        );
        let id = UrsId(self.next_id);
        self.next_id += 1;
        self.live.insert(
            id,
            UndoRecordSet {
                set_type,
                persistence,
                nesting_level,
                state: UrsState::Clean,
                chunks: SmallVec::new(),
                buffers: SmallVec::new(),
                slot: None,
                recent_end: 0,
                begin: UndoRecPtr::INVALID,
                pending_size: 0,
                need_chunk_header: false,
                need_type_header: true,
                chunk_to_close: None,
                type_header: SmallVec::from_slice(type_header),
            },
        );
        Ok(id)
    }

    fn set_mut(&mut self, id: UrsId) -> &mut UndoRecordSet {
        self.live.get_mut(&id).expect("unknown undo record set")
    }

    /// Reserves space for a record of `record_size` bytes, pinning and
    /// locking every page the insertion will touch. Returns the pointer
    /// to the caller's first data byte, past any chunk or type header the
    /// insertion will prepend.
    ///
    /// When the active log cannot fit the insertion, the current chunk is
    /// queued for closing (its size patch rides on the same WAL record)
    /// and a new chunk is opened in a freshly acquired log.
    pub fn prepare_insert(&mut self, id: UrsId, record_size: usize) -> Result<UndoRecPtr> {
        ensure!(record_size > 0, "undo record must not be empty");
        let shared = Arc::clone(&self.shared);
        let urs = self.set_mut(id);
        assert!(
            urs.state != UrsState::Closed,
            "insert prepared on a closed undo record set"
        );
        assert!(
            urs.buffers.is_empty(),
            "buffers still pinned from a previous operation"
        );

        let begin;
        let header_size;
        loop {
            let hs = if urs.need_chunk_header {
                UNDO_CHUNK_HEADER_SIZE
                    + if urs.need_type_header {
                        urs.type_header.len()
                    } else {
                        0
                    }
            } else {
                0
            };
            let total = hs + record_size;

            if let Some(slot) = urs.slot.clone() {
                let fresh = slot.meta().read().insert == UNDO_PAGE_HEADER_SIZE as u64;
                if let Some(b) = reserve_physical_undo(&shared, urs, &slot, total)? {
                    begin = b;
                    header_size = hs;
                    break;
                }
                // The log is full. An empty log that cannot fit the
                // insertion means no log ever will.
                ensure!(
                    !fresh,
                    "unable to register undo request for {} bytes",
                    total
                );
                let last = urs.chunks.len() - 1;
                if urs.chunks[last].header_written {
                    urs.chunk_to_close = Some(last);
                } else {
                    let chunk = urs.chunks.pop().expect("chunk table empty");
                    shared.logs.put(&chunk.slot);
                }
            }

            create_new_chunk(&shared, urs)?;
        }

        // Pin every page in [begin, begin + header_size + record_size),
        // then lock in a second pass so no content lock is held across a
        // read that may evict.
        let total = header_size + record_size;
        urs.buffers.reserve(total / BLCKSZ + 2);
        let logno = begin.logno();
        let permanent = urs.persistence == Persistence::Permanent;
        let mut block = begin.block();
        let mut offset = begin.page_offset();
        let mut remaining = total;
        while remaining > 0 {
            let mut flags = BUF_NEEDS_DIRTY;
            if permanent {
                flags |= BUF_NEEDS_WAL;
            }
            let mode = if offset == UNDO_PAGE_HEADER_SIZE {
                flags |= BUF_IS_NEW | BUF_NEEDS_INIT;
                ReadMode::Zero
            } else {
                ReadMode::Normal
            };
            let frame = shared.buffers.read_buffer(BufferTag::new(logno, block), mode)?;
            urs.buffers.push(SetBuffer {
                frame,
                guard: None,
                flags,
                bufdata: UndoBufData::default(),
            });
            remaining -= (BLCKSZ - offset).min(remaining);
            block += 1;
            offset = UNDO_PAGE_HEADER_SIZE;
        }
        for set_buffer in urs.buffers.iter_mut() {
            set_buffer.guard = Some(set_buffer.frame.lock_exclusive());
        }

        // Pin the header page(s) of a chunk we abandoned above, last, so
        // redo sees the inserted pages before the incidental close patch.
        if let Some(chunk_index) = urs.chunk_to_close {
            prepare_chunk_close_buffers(&shared, urs, chunk_index)?;
        }

        urs.begin = begin;
        urs.pending_size = record_size;
        Ok(begin.plus_usable_bytes(header_size))
    }

    /// Writes the record (and any headers the planner decided on) into
    /// the pinned pages, advances the shared insert pointer, and stages
    /// the per-buffer WAL instructions. Must be bracketed by
    /// [`UndoEngine::prepare_insert`] and [`UndoEngine::release`].
    pub fn insert(&mut self, id: UrsId, record: &[u8]) {
        let urs = self.set_mut(id);
        assert!(
            urs.state != UrsState::Closed,
            "insert into a closed undo record set"
        );
        assert!(
            record.len() == urs.pending_size,
            "insert of {} bytes but {} were prepared",
            record.len(),
            urs.pending_size
        );
        let slot = urs.slot.clone().expect("insert without prepared space");
        let permanent = urs.persistence == Persistence::Permanent;
        let set_type = urs.set_type as u8;

        let start = slot.meta().read().insert;
        debug_assert_eq!(UndoRecPtr::new(slot.logno(), start), urs.begin);
        let mut cursor = AppendCursor {
            buf_idx: 0,
            offset: start,
        };

        if permanent {
            let bufdata = &mut urs.buffers[0].bufdata;
            if bufdata.flags & URS_XLOG_INSERT == 0 {
                bufdata.flags |= URS_XLOG_INSERT;
                bufdata.insert_page_offset = page_offset_of(start) as u16;
            }
        }

        if urs.need_chunk_header {
            let nchunks = urs.chunks.len();
            let chunk_start = urs.chunks[nchunks - 1].header_offset;
            let previous = if nchunks >= 2 {
                let prev = &urs.chunks[nchunks - 2];
                UndoRecPtr::new(prev.slot.logno(), prev.header_offset)
            } else {
                UndoRecPtr::INVALID
            };
            let header = ChunkHeader::new(0, previous, set_type);
            let mut image: SmallVec<[u8; 96]> = SmallVec::from_slice(header.as_bytes());
            if urs.need_type_header {
                image.extend_from_slice(&urs.type_header);
            }
            if permanent {
                let bufdata = &mut urs.buffers[0].bufdata;
                if urs.need_type_header {
                    bufdata.flags |= URS_XLOG_CREATE;
                    bufdata.urs_type = set_type;
                    bufdata.type_header = urs.type_header.clone();
                } else {
                    bufdata.flags |= URS_XLOG_ADD_CHUNK;
                    bufdata.urs_type = set_type;
                    bufdata.previous_chunk_header_location = previous;
                }
            }
            append_bytes(
                &mut urs.buffers,
                &mut cursor,
                &image,
                AppendKind::Header,
                chunk_start,
                permanent,
                set_type,
            );
            urs.chunks[nchunks - 1].header_written = true;
        }

        let chunk_start = urs.chunks.last().expect("no chunk to insert into").header_offset;
        append_bytes(
            &mut urs.buffers,
            &mut cursor,
            record,
            AppendKind::Record,
            chunk_start,
            permanent,
            set_type,
        );

        slot.meta().write().insert = cursor.offset;

        // A chunk abandoned by the planner gets its size patched as part
        // of this same WAL record.
        if let Some(chunk_index) = urs.chunk_to_close.take() {
            mark_chunk_closed(urs, chunk_index, false);
        }

        urs.need_chunk_header = false;
        urs.need_type_header = false;
        urs.pending_size = 0;
        urs.state = UrsState::Dirty;
    }

    /// Pins and locks the final chunk's header page(s) ahead of
    /// [`UndoEngine::mark_closed`]. Returns false when the set never
    /// wrote anything, in which case it can be destroyed directly.
    pub fn prepare_close(&mut self, id: UrsId) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let urs = self.set_mut(id);
        assert!(
            urs.state != UrsState::Closed,
            "close prepared on a closed undo record set"
        );
        if urs.chunks.is_empty() {
            return Ok(false);
        }
        let last = urs.chunks.len() - 1;
        prepare_chunk_close_buffers(&shared, urs, last)?;
        Ok(true)
    }

    /// Patches the final chunk's size, closing the set. Runs inside the
    /// caller's critical section with the header buffers held.
    pub fn mark_closed(&mut self, id: UrsId) {
        let urs = self.set_mut(id);
        assert!(
            urs.state != UrsState::Closed,
            "undo record set already closed"
        );
        assert!(urs.state == UrsState::Clean || !urs.chunks.is_empty());
        if urs.chunks.is_empty() {
            return;
        }
        let last = urs.chunks.len() - 1;
        assert!(
            urs.chunks[last].header_written,
            "closing a chunk whose header was never written"
        );
        mark_chunk_closed(urs, last, true);
        if urs.state == UrsState::Dirty {
            urs.state = UrsState::Closed;
        }
    }

    /// Registers every buffer modified since `prepare_insert` /
    /// `prepare_close` with the WAL record under construction, attaching
    /// the staged per-buffer instructions. Block ids start at
    /// `first_block_id` so the caller can register its own buffers below
    /// it.
    pub fn register_wal_buffers(
        &mut self,
        id: UrsId,
        builder: &mut WalRecordBuilder,
        first_block_id: u8,
    ) {
        let full_page_images = self.shared.wal.full_page_images();
        let urs = self.set_mut(id);
        register_set_buffers(urs, builder, first_block_id, full_page_images);
    }

    /// Stamps the WAL record's LSN on every page written under it.
    pub fn set_lsn(&mut self, id: UrsId, lsn: Lsn) {
        let urs = self.set_mut(id);
        set_buffers_lsn(urs, lsn);
    }

    /// Unlocks and unpins everything the set holds.
    pub fn release(&mut self, id: UrsId) {
        let urs = self.set_mut(id);
        release_set(urs);
    }

    /// Frees the set and returns its undo logs to the allocator. The set
    /// must not be dirty: a dirty set that is never closed would leave an
    /// unbounded open chunk behind.
    pub fn destroy(&mut self, id: UrsId) {
        let mut urs = self.live.remove(&id).expect("unknown undo record set");
        release_set(&mut urs);
        if urs.state == UrsState::Dirty {
            panic!("dirty undo record set not closed before destroy");
        }
        for chunk in urs.chunks.iter() {
            self.shared.logs.put(&chunk.slot);
        }
    }

    /// Forgets pin and lock bookkeeping for every live set. The abort
    /// path calls this once the buffer manager's locks are gone; the
    /// close still happens later via [`UndoEngine::close_and_destroy_for_level`].
    pub fn reset_insertion(&mut self) {
        for urs in self.live.values_mut() {
            urs.buffers.clear();
            urs.chunk_to_close = None;
            urs.pending_size = 0;
            for chunk in urs.chunks.iter_mut() {
                chunk.header_buffer_index = [None, None];
            }
        }
    }

    fn level_ids(&self, nesting_level: u32) -> Vec<UrsId> {
        let mut ids: Vec<UrsId> = self
            .live
            .iter()
            .filter(|(_, urs)| urs.nesting_level >= nesting_level)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// [`UndoEngine::prepare_close`] for every dirty set at or below
    /// this transaction level.
    pub fn prepare_close_for_level(&mut self, nesting_level: u32) -> Result<bool> {
        let mut needs_work = false;
        for id in self.level_ids(nesting_level) {
            if self.live[&id].state == UrsState::Dirty && self.prepare_close(id)? {
                needs_work = true;
            }
        }
        Ok(needs_work)
    }

    /// [`UndoEngine::mark_closed`] for every dirty set at or below this
    /// transaction level.
    pub fn mark_closed_for_level(&mut self, nesting_level: u32) {
        for id in self.level_ids(nesting_level) {
            if self.live[&id].state == UrsState::Dirty {
                self.mark_closed(id);
            }
        }
    }

    /// Registers the buffers of every set closed at this level, packing
    /// their block ids consecutively from `first_block_id`.
    pub fn register_wal_buffers_for_level(
        &mut self,
        nesting_level: u32,
        builder: &mut WalRecordBuilder,
        first_block_id: u8,
    ) {
        let full_page_images = self.shared.wal.full_page_images();
        let mut next_block_id = first_block_id;
        for id in self.level_ids(nesting_level) {
            let urs = self.live.get_mut(&id).expect("id from live map");
            if urs.persistence != Persistence::Permanent || urs.buffers.is_empty() {
                continue;
            }
            let nbuffers = urs.buffers.len() as u8;
            register_set_buffers(urs, builder, next_block_id, full_page_images);
            next_block_id += nbuffers;
        }
    }

    /// Stamps `lsn` on every set touched at this level.
    pub fn set_lsn_for_level(&mut self, nesting_level: u32, lsn: Lsn) {
        for id in self.level_ids(nesting_level) {
            let urs = self.live.get_mut(&id).expect("id from live map");
            set_buffers_lsn(urs, lsn);
        }
    }

    /// Releases and destroys every set at this level. Content locks are
    /// dropped for all sets first, then each set is destroyed.
    pub fn destroy_for_level(&mut self, nesting_level: u32) {
        let ids = self.level_ids(nesting_level);
        for id in &ids {
            self.release(*id);
        }
        for id in ids {
            self.destroy(id);
        }
    }

    /// Closes and destroys every set at this level, carrying the close
    /// patches on a dedicated no-op WAL record. Used when a transaction
    /// level ends without another record to piggyback on. Returns true if
    /// any set needed closing.
    pub fn close_and_destroy_for_level(&mut self, nesting_level: u32) -> Result<bool> {
        let needs_work = self.prepare_close_for_level(nesting_level)?;
        if needs_work {
            let mut builder = WalRecordBuilder::new();
            self.mark_closed_for_level(nesting_level);
            self.register_wal_buffers_for_level(nesting_level, &mut builder, 0);
            builder.register_data(&[0u8; NOOP_FILLER_SIZE]);
            let lsn = self.shared.wal.insert(&builder, RM_XLOG, XLOG_NOOP)?;
            self.set_lsn_for_level(nesting_level, lsn);
        }
        self.destroy_for_level(nesting_level);
        Ok(needs_work)
    }

    /// Number of live sets (all nesting levels).
    pub fn live_sets(&self) -> usize {
        self.live.len()
    }

    pub fn state(&self, id: UrsId) -> UrsState {
        self.live[&id].state
    }

    /// Header locations of the set's chunks, in order.
    pub fn chunk_locations(&self, id: UrsId) -> Vec<UndoRecPtr> {
        self.live[&id]
            .chunks
            .iter()
            .map(|chunk| UndoRecPtr::new(chunk.slot.logno(), chunk.header_offset))
            .collect()
    }
}

impl Drop for UndoEngine {
    fn drop(&mut self) {
        if !self.live.is_empty() && !std::thread::panicking() {
            panic!("undo record set not closed before backend exit");
        }
    }
}

struct AppendCursor {
    buf_idx: usize,
    offset: UndoLogOffset,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AppendKind {
    Header,
    Record,
}

/// Walks the pinned buffers writing `data` from the cursor position,
/// initializing and dirtying pages on first touch and staging
/// page-continuation instructions for redo.
fn append_bytes(
    buffers: &mut [SetBuffer],
    cursor: &mut AppendCursor,
    data: &[u8],
    kind: AppendKind,
    chunk_start: UndoLogOffset,
    permanent: bool,
    set_type: u8,
) {
    let mut data_offset = 0;
    while data_offset < data.len() {
        let page_offset = page_offset_of(cursor.offset);
        let set_buffer = &mut buffers[cursor.buf_idx];

        if set_buffer.flags & BUF_NEEDS_INIT != 0 {
            let guard = set_buffer.guard.as_mut().expect("buffer not locked");
            UndoPageMut::new(&mut guard[..]).init();
            set_buffer.flags &= !BUF_NEEDS_INIT;
        }
        if set_buffer.flags & BUF_NEEDS_DIRTY != 0 {
            set_buffer.frame.mark_dirty();
            set_buffer.flags &= !BUF_NEEDS_DIRTY;
        }
        if permanent
            && page_offset == UNDO_PAGE_HEADER_SIZE
            && set_buffer.bufdata.flags
                & (URS_XLOG_CREATE | URS_XLOG_ADD_CHUNK | URS_XLOG_ADD_PAGE)
                == 0
        {
            set_buffer.bufdata.flags |= URS_XLOG_ADD_PAGE;
            set_buffer.bufdata.chunk_header_location =
                UndoRecPtr::new(set_buffer.frame.tag().logno, chunk_start);
            set_buffer.bufdata.urs_type = set_type;
        }

        let guard = set_buffer.guard.as_mut().expect("buffer not locked");
        let mut page = UndoPageMut::new(&mut guard[..]);
        let written = match kind {
            AppendKind::Header => page.insert_header(page_offset, data_offset, data, chunk_start),
            AppendKind::Record => page.insert_record(page_offset, data_offset, data, chunk_start),
        };
        data_offset += written;
        cursor.offset += written as u64;
        if page_offset_of(cursor.offset) == 0 {
            cursor.buf_idx += 1;
            cursor.offset += UNDO_PAGE_HEADER_SIZE as u64;
        }
    }
}

/// Finds an already pinned buffer for `(logno, block)` or pins and locks
/// a new one. Used on the close paths, where insertion buffers from the
/// same WAL record may already hold the page.
fn find_or_read_buffer(
    shared: &UndoShared,
    urs: &mut UndoRecordSet,
    logno: UndoLogNumber,
    block: u32,
) -> Result<usize> {
    let tag = BufferTag::new(logno, block);
    for (i, set_buffer) in urs.buffers.iter().enumerate() {
        if set_buffer.frame.tag() == tag {
            return Ok(i);
        }
    }
    let frame = shared.buffers.read_buffer(tag, ReadMode::Normal)?;
    let mut flags = BUF_NEEDS_DIRTY;
    if urs.persistence == Persistence::Permanent {
        flags |= BUF_NEEDS_WAL;
    }
    let guard = frame.lock_exclusive();
    urs.buffers.push(SetBuffer {
        frame,
        guard: Some(guard),
        flags,
        bufdata: UndoBufData::default(),
    });
    Ok(urs.buffers.len() - 1)
}

/// Pins and locks the buffer(s) holding a chunk's size field: one page,
/// or two when the 8-byte field straddles a boundary.
fn prepare_chunk_close_buffers(
    shared: &UndoShared,
    urs: &mut UndoRecordSet,
    chunk_index: usize,
) -> Result<()> {
    let (logno, header_offset) = {
        let chunk = &urs.chunks[chunk_index];
        (chunk.slot.logno(), chunk.header_offset)
    };
    let block = block_of(header_offset);
    let page_offset = page_offset_of(header_offset);

    let first = find_or_read_buffer(shared, urs, logno, block)?;
    let second = if page_offset <= BLCKSZ - 8 {
        None
    } else {
        Some(find_or_read_buffer(shared, urs, logno, block + 1)?)
    };
    urs.chunks[chunk_index].header_buffer_index = [Some(first), second];
    Ok(())
}

/// Patches a chunk's size field in place and stages the close
/// instructions. `close_set` additionally marks the whole set closed in
/// the staged instructions (type, type header, first-chunk location).
fn mark_chunk_closed(urs: &mut UndoRecordSet, chunk_index: usize, close_set: bool) {
    let (size, page_offset0, first_index, second_index) = {
        let chunk = &urs.chunks[chunk_index];
        debug_assert!(chunk.header_written);
        let insert = chunk.slot.meta().read().insert;
        (
            insert - chunk.header_offset,
            page_offset_of(chunk.header_offset),
            chunk.header_buffer_index[0].expect("chunk close not prepared"),
            chunk.header_buffer_index[1],
        )
    };

    if urs.persistence == Persistence::Permanent {
        let first_chunk_location = {
            let first = &urs.chunks[0];
            UndoRecPtr::new(first.slot.logno(), first.header_offset)
        };
        let bufdata = &mut urs.buffers[first_index].bufdata;
        bufdata.flags |= URS_XLOG_CLOSE_CHUNK;
        bufdata.chunk_size_page_offset = page_offset0 as u16;
        bufdata.chunk_size = size;
        if close_set {
            bufdata.flags |= URS_XLOG_CLOSE;
            bufdata.urs_type = urs.set_type as u8;
            bufdata.type_header = urs.type_header.clone();
            if urs.chunks.len() > 1 {
                bufdata.flags |= URS_XLOG_CLOSE_MULTI_CHUNK;
                bufdata.first_chunk_header_location = first_chunk_location;
            }
        }
    }

    let size_bytes = size.to_le_bytes();
    let mut data_offset = 0;
    let mut page_offset = page_offset0;
    let mut indexes = [Some(first_index), second_index].into_iter().flatten();
    while data_offset < size_bytes.len() {
        let index = indexes.next().expect("straddling close not prepared");
        let set_buffer = &mut urs.buffers[index];
        if set_buffer.flags & BUF_NEEDS_DIRTY != 0 {
            set_buffer.frame.mark_dirty();
            set_buffer.flags &= !BUF_NEEDS_DIRTY;
        }
        let guard = set_buffer.guard.as_mut().expect("buffer not locked");
        data_offset += UndoPageMut::new(&mut guard[..]).overwrite(page_offset, data_offset, &size_bytes);
        page_offset = UNDO_PAGE_HEADER_SIZE;
    }
}

fn register_set_buffers(
    urs: &mut UndoRecordSet,
    builder: &mut WalRecordBuilder,
    first_block_id: u8,
    full_page_images: bool,
) {
    if urs.persistence != Persistence::Permanent {
        return;
    }
    for (i, set_buffer) in urs.buffers.iter_mut().enumerate() {
        if set_buffer.flags & BUF_NEEDS_DIRTY != 0 {
            // Pinned but never written; nothing to log.
            continue;
        }
        let block_id = first_block_id + i as u8;
        if set_buffer.flags & BUF_NEEDS_WAL != 0 {
            let register_flags = if set_buffer.flags & BUF_IS_NEW != 0 {
                REGBUF_WILL_INIT
            } else {
                0
            };
            let tag = set_buffer.frame.tag();
            builder.register_undo_buffer(block_id, tag.logno, tag.block, register_flags);
            set_buffer.flags &= !BUF_NEEDS_WAL;
            if full_page_images && set_buffer.flags & BUF_IS_NEW == 0 {
                let guard = set_buffer.guard.as_ref().expect("buffer not locked");
                builder.register_image(block_id, &guard[..]);
            }
        }
        if !set_buffer.bufdata.is_empty() {
            builder.register_buf_data(block_id, &set_buffer.bufdata.encode());
            set_buffer.bufdata = UndoBufData::default();
        }
    }
}

fn set_buffers_lsn(urs: &mut UndoRecordSet, lsn: Lsn) {
    for set_buffer in urs.buffers.iter_mut() {
        if set_buffer.flags & BUF_NEEDS_DIRTY != 0 {
            continue;
        }
        let guard = set_buffer.guard.as_mut().expect("buffer not locked");
        UndoPageMut::new(&mut guard[..]).set_lsn(lsn);
    }
}

fn release_set(urs: &mut UndoRecordSet) {
    urs.buffers.clear();
    for chunk in urs.chunks.iter_mut() {
        chunk.header_buffer_index = [None, None];
    }
}

/// Reserves physically backed space for `total` bytes in the active log.
/// Returns the insertion start, or `None` after marking the log full and
/// detaching it.
fn reserve_physical_undo(
    shared: &UndoShared,
    urs: &mut UndoRecordSet,
    slot: &Arc<UndoLogSlot>,
    total: usize,
) -> Result<Option<UndoRecPtr>> {
    let insert = slot.meta().read().insert;
    let new_insert = offset_plus_usable_bytes(insert, total);

    // Fast path: known backed space.
    if new_insert <= urs.recent_end {
        return Ok(Some(UndoRecPtr::new(slot.logno(), insert)));
    }

    // The discard worker may have advanced `end` since we last looked.
    urs.recent_end = slot.meta().read().end;
    if new_insert <= urs.recent_end {
        return Ok(Some(UndoRecPtr::new(slot.logno(), insert)));
    }

    // Extend the backing if the log's cap allows it.
    let size_cap = slot.meta().read().size;
    if new_insert <= size_cap {
        shared.logs.adjust_physical_range(slot.logno(), new_insert)?;
        urs.recent_end = slot.meta().read().end;
        return Ok(Some(UndoRecPtr::new(slot.logno(), insert)));
    }

    shared.logs.mark_full(slot);
    urs.slot = None;
    Ok(None)
}

/// Acquires a fresh log and opens a new chunk in it.
fn create_new_chunk(shared: &UndoShared, urs: &mut UndoRecordSet) -> Result<()> {
    let slot = shared.logs.get_for_persistence(urs.persistence)?;
    urs.need_chunk_header = true;
    urs.recent_end = 0;
    let header_offset = slot.meta().read().insert;
    urs.chunks.push(Chunk {
        slot: Arc::clone(&slot),
        header_offset,
        header_written: false,
        header_buffer_index: [None, None],
    });
    urs.slot = Some(slot);
    Ok(())
}
