//! # Crash Recovery
//!
//! A crash can leave the final chunk of an undo log open: its header's
//! `size` field still zero because the owning backend never got to close
//! it. At most one chunk per log can be in that state. The startup sweep
//! finds such chunks by scanning each log's final page, patches the
//! missing size, and emits a no-op WAL record carrying the close so that
//! a subsequent replay reconstructs the same bytes.
//!
//! The scan needs no state beyond the page markers the codec maintains:
//! `first_chunk` gives the first chunk header beginning on the final
//! page, and closed chunk sizes chain forward from there; if no header
//! begins on the page, `continue_chunk` points straight at the open
//! chunk's header. From the open chunk the sweep walks `previous_chunk`
//! back to the set's first chunk to recover the type and type header for
//! the close callback.

use smallvec::SmallVec;
use tracing::info;

use eyre::{ensure, Result};

use crate::buffer::{BufferTag, ReadMode};
use crate::config::{BLCKSZ, NOOP_FILLER_SIZE, UNDO_CHUNK_HEADER_SIZE, UNDO_PAGE_HEADER_SIZE};
use crate::log::{block_of, page_offset_of, UndoLogOffset, UndoRecPtr};
use crate::page::{ChunkHeader, UndoPageMut};
use crate::wal::bufdata::{
    UndoBufData, URS_XLOG_CLOSE, URS_XLOG_CLOSE_CHUNK, URS_XLOG_CLOSE_MULTI_CHUNK,
};
use crate::wal::{WalRecordBuilder, RM_XLOG, XLOG_NOOP};
use crate::xact::UndoSetType;

use super::UndoShared;

/// Closes every chunk left open by a crash. Returns the number of sets
/// closed. Must run before any engine starts writing; afterwards the
/// surviving logs are reusable.
pub fn close_dangling_sets(shared: &UndoShared) -> Result<u32> {
    let mut closed = 0;
    for slot in shared.logs().all_slots() {
        let (insert, discard) = {
            let meta = slot.meta().read();
            (meta.insert, meta.discard)
        };
        if discard >= insert {
            continue;
        }

        let logno = slot.logno();
        let Some(header_offset) = find_open_chunk(shared, logno, insert)? else {
            continue;
        };

        // Recover the set's identity from its first chunk.
        let mut first = UndoRecPtr::new(logno, header_offset);
        let mut header = read_chunk_header(shared, first)?;
        while UndoRecPtr::from_raw(header.previous_chunk()).is_valid() {
            let previous = UndoRecPtr::from_raw(header.previous_chunk());
            let previous_slot = shared
                .logs()
                .get_slot(previous.logno())
                .unwrap_or_else(|| panic!("previous undo chunk {} is in an unknown log", previous));
            if previous.offset() < previous_slot.meta().read().discard {
                panic!("previous undo chunk {} is already discarded", previous);
            }
            header = read_chunk_header(shared, previous)?;
            first = previous;
        }
        let set_type = UndoSetType::from_u8(header.set_type())?;
        let type_header_bytes = shared.read_bytes(
            first.plus_usable_bytes(UNDO_CHUNK_HEADER_SIZE),
            set_type.type_header_size(),
        )?;
        let type_header: SmallVec<[u8; 64]> = SmallVec::from_slice(&type_header_bytes);

        let chunk_size = insert - header_offset;
        write_close_record(
            shared,
            logno,
            header_offset,
            chunk_size,
            set_type,
            &type_header,
            first,
        )?;
        info!(
            logno,
            header_offset, chunk_size, "closed undo record set left open by crash"
        );

        if set_type == UndoSetType::Transaction {
            if let Some(hook) = shared.hook() {
                hook.on_set_closed(
                    &type_header,
                    first,
                    UndoRecPtr::new(logno, insert),
                    false,
                    false,
                );
            }
        }
        closed += 1;
    }

    shared.logs().rebuild_freelists();
    Ok(closed)
}

/// Scans the page holding the last written byte of a log for an open
/// chunk header, returning its offset. `None` means the log's final
/// chunk is closed.
fn find_open_chunk(
    shared: &UndoShared,
    logno: u32,
    insert: UndoLogOffset,
) -> Result<Option<UndoLogOffset>> {
    // The byte before `insert` is the last one written; if `insert` sits
    // at the top of a fresh page, that byte lives on the previous page.
    let final_block = if page_offset_of(insert) <= UNDO_PAGE_HEADER_SIZE {
        block_of(insert) - 1
    } else {
        block_of(insert)
    };
    let frame = shared
        .buffers()
        .read_buffer(BufferTag::new(logno, final_block), ReadMode::Normal)?;
    let (first_chunk, continue_chunk) = frame.with_page(|page| {
        let header = crate::page::UndoPageRef::new(page).header();
        (header.first_chunk(), header.continue_chunk())
    });

    let candidate = if first_chunk != 0 {
        // Walk the chunk headers beginning on this page by their sizes.
        let block_base = final_block as u64 * BLCKSZ as u64;
        let mut current = block_base + first_chunk as u64;
        loop {
            let header = read_chunk_header(shared, UndoRecPtr::new(logno, current))?;
            if header.size() == 0 {
                break current;
            }
            let next = current + header.size();
            if next == insert {
                // Every chunk on this page is closed.
                return Ok(None);
            }
            ensure!(
                next > current
                    && next < insert
                    && block_of(next) == final_block
                    && page_offset_of(next) >= UNDO_PAGE_HEADER_SIZE,
                "unexpected undo chunk size {} at {:016X} in log {}",
                header.size(),
                current,
                logno
            );
            current = next;
        }
    } else {
        // The whole page continues one chunk; its header is behind us.
        ensure!(
            continue_chunk != 0,
            "final undo page of log {} has no chunk markers",
            logno
        );
        let header = read_chunk_header(shared, UndoRecPtr::new(logno, continue_chunk))?;
        if header.size() != 0 {
            return Ok(None);
        }
        continue_chunk
    };
    Ok(Some(candidate))
}

fn read_chunk_header(shared: &UndoShared, location: UndoRecPtr) -> Result<ChunkHeader> {
    let bytes = shared.read_bytes(location, UNDO_CHUNK_HEADER_SIZE)?;
    ChunkHeader::parse(&bytes)
}

/// Patches the open chunk's size in place and emits the no-op close
/// record, exactly as a live close would have.
fn write_close_record(
    shared: &UndoShared,
    logno: u32,
    header_offset: UndoLogOffset,
    chunk_size: u64,
    set_type: UndoSetType,
    type_header: &[u8],
    first_chunk: UndoRecPtr,
) -> Result<()> {
    let header_block = block_of(header_offset);
    let page_offset0 = page_offset_of(header_offset);
    let straddles = page_offset0 > BLCKSZ - 8;

    let first_frame = shared
        .buffers()
        .read_buffer(BufferTag::new(logno, header_block), ReadMode::Normal)?;
    let second_frame = if straddles {
        Some(
            shared
                .buffers()
                .read_buffer(BufferTag::new(logno, header_block + 1), ReadMode::Normal)?,
        )
    } else {
        None
    };

    let mut guards = vec![first_frame.lock_exclusive()];
    if let Some(frame) = &second_frame {
        guards.push(frame.lock_exclusive());
    }

    let size_bytes = chunk_size.to_le_bytes();
    let mut data_offset = 0;
    let mut page_offset = page_offset0;
    for guard in guards.iter_mut() {
        if data_offset == size_bytes.len() {
            break;
        }
        data_offset +=
            UndoPageMut::new(&mut guard[..]).overwrite(page_offset, data_offset, &size_bytes);
        page_offset = UNDO_PAGE_HEADER_SIZE;
    }
    first_frame.mark_dirty();
    if let Some(frame) = &second_frame {
        frame.mark_dirty();
    }

    let mut bufdata = UndoBufData {
        flags: URS_XLOG_CLOSE_CHUNK | URS_XLOG_CLOSE,
        urs_type: set_type as u8,
        type_header: SmallVec::from_slice(type_header),
        chunk_size_page_offset: page_offset0 as u16,
        chunk_size,
        ..Default::default()
    };
    if first_chunk != UndoRecPtr::new(logno, header_offset) {
        bufdata.flags |= URS_XLOG_CLOSE_MULTI_CHUNK;
        bufdata.first_chunk_header_location = first_chunk;
    }

    let mut builder = WalRecordBuilder::new();
    builder.register_undo_buffer(0, logno, header_block, 0);
    builder.register_buf_data(0, &bufdata.encode());
    if second_frame.is_some() {
        builder.register_undo_buffer(1, logno, header_block + 1, 0);
    }
    builder.register_data(&[0u8; NOOP_FILLER_SIZE]);
    let lsn = shared.wal().insert(&builder, RM_XLOG, XLOG_NOOP)?;

    for guard in guards.iter_mut() {
        UndoPageMut::new(&mut guard[..]).set_lsn(lsn);
    }
    Ok(())
}
