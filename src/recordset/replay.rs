//! # Redo
//!
//! Reapplies the undo-side effects of a WAL record: chunk creation,
//! record insertion, page continuation, and chunk closes, exactly as the
//! do-time code performed them. The per-buffer instructions staged at
//! do time fully describe the changes; the record body itself is
//! reconstructed by the calling access method's redo routine and passed
//! in as `payload`.
//!
//! Headers, record bodies, and the 8-byte close patch may each straddle
//! registered blocks, so the replayer carries continuation state from
//! block to block and drains it, in a fixed order, before handling the
//! flags of the next block. A block restored from a full-page image (or
//! already discarded) is not rewritten, but the position bookkeeping
//! still advances across it so later blocks land at the right offsets.

use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

use eyre::{ensure, Result};

use crate::buffer::{BufferTag, Frame, PageWriteGuard, ReadMode, RedoAction};
use crate::config::{BLCKSZ, MAX_TYPE_HEADER_SIZE, UNDO_PAGE_HEADER_SIZE};
use crate::log::{Persistence, UndoLogOffset, UndoLogSlot, UndoRecPtr};
use crate::page::{bytes_on_page, ChunkHeader, UndoPageMut};
use crate::wal::bufdata::{
    UndoBufData, URS_XLOG_ADD_CHUNK, URS_XLOG_ADD_PAGE, URS_XLOG_CLOSE, URS_XLOG_CLOSE_CHUNK,
    URS_XLOG_CLOSE_MULTI_CHUNK, URS_XLOG_CREATE, URS_XLOG_INSERT,
};
use crate::wal::{
    BlockKind, WalRecord, RM_XACT, RM_XLOG, XACT_ABORT, XACT_COMMIT, XACT_OPMASK, XACT_PREPARE,
    XLOG_NOOP,
};
use crate::xact::UndoSetType;
use zerocopy::IntoBytes;

use super::UndoShared;

/// What remains of the in-progress insertion stream.
enum InsertPhase {
    Idle,
    Header {
        bytes: SmallVec<[u8; 96]>,
        data_offset: usize,
    },
    Record {
        data_offset: usize,
    },
}

struct SizeCont {
    bytes: [u8; 8],
    data_offset: usize,
}

struct PendingClose {
    type_header: SmallVec<[u8; MAX_TYPE_HEADER_SIZE]>,
    begin: UndoRecPtr,
    end: UndoRecPtr,
}

struct TouchedBlock {
    frame: Arc<Frame>,
    guard: PageWriteGuard,
    restored: bool,
}

/// Reapplies a WAL record's registered undo blocks. Returns the location
/// of the caller's payload when the record carried an insertion, for the
/// access method to wire into its own redo.
pub fn replay(
    shared: &UndoShared,
    record: &WalRecord,
    payload: Option<&[u8]>,
) -> Result<Option<UndoRecPtr>> {
    let mut phase = InsertPhase::Idle;
    let mut size_cont: Option<SizeCont> = None;
    let mut pending_close: Option<PendingClose> = None;
    let mut chunk_start: UndoLogOffset = 0;
    let mut result_begin: Option<UndoRecPtr> = None;
    let mut insert_slot: Option<Arc<UndoLogSlot>> = None;
    let mut insert_end: UndoLogOffset = 0;
    let mut touched: Vec<TouchedBlock> = Vec::with_capacity(record.blocks.len());

    for block in record.blocks.iter().filter(|b| b.kind == BlockKind::Undo) {
        let slot = shared
            .logs()
            .get_or_create_slot(block.logno, Persistence::Permanent)?;
        let block_base = block.block as u64 * BLCKSZ as u64;
        let past_this_block = block_base + BLCKSZ as u64;
        if slot.meta().read().end < past_this_block {
            shared.logs().adjust_physical_range(block.logno, past_this_block)?;
        }

        let bufdata = UndoBufData::decode(&block.buf_data)?;

        // A block wholly below the discard pointer was thrown away later
        // in the WAL; keep the bookkeeping but write nothing.
        let not_found = slot.meta().read().discard >= past_this_block;
        let mut skip = not_found;
        let mut entry: Option<TouchedBlock> = None;
        if not_found {
            debug!(
                logno = block.logno,
                block = block.block,
                "registered undo block already discarded; skipping"
            );
        } else {
            let mode = if block.will_init() {
                ReadMode::ZeroAndLock
            } else {
                ReadMode::Normal
            };
            let (action, frame, mut guard) = shared.buffers().read_for_redo(
                BufferTag::new(block.logno, block.block),
                mode,
                block.image.as_deref(),
                record.lsn,
            )?;
            let restored = action == RedoAction::Restored;
            if restored {
                skip = true;
                if bufdata.flags & URS_XLOG_INSERT != 0 {
                    // The insertion began on this page. An online
                    // checkpoint can capture a future insert location;
                    // the image's page header is authoritative. A close
                    // patch carried on a restored page never moves the
                    // insert pointer.
                    let mut insertion_point =
                        UndoPageMut::new(&mut guard[..]).header().insertion_point();
                    if insertion_point == 0 {
                        insertion_point = UNDO_PAGE_HEADER_SIZE as u16;
                    }
                    slot.meta().write().insert = block_base + insertion_point as u64;
                }
            } else if block.will_init() {
                UndoPageMut::new(&mut guard[..]).init();
            }
            entry = Some(TouchedBlock {
                frame,
                guard,
                restored,
            });
        }

        if bufdata.flags & URS_XLOG_ADD_PAGE != 0 {
            chunk_start = bufdata.chunk_header_location.offset();
        }

        let mut page_offset = if bufdata.flags & URS_XLOG_INSERT != 0 {
            let start = block_base + bufdata.insert_page_offset as u64;
            slot.meta().write().insert = start;
            insert_slot = Some(Arc::clone(&slot));
            bufdata.insert_page_offset as usize
        } else {
            UNDO_PAGE_HEADER_SIZE
        };

        // Drain the straddled close patch first: it belongs to the
        // previous block's chunk and is independent of the insertion
        // stream position.
        if let Some(mut cont) = size_cont.take() {
            let n = match entry.as_mut() {
                Some(e) if !skip => UndoPageMut::new(&mut e.guard[..]).overwrite(
                    UNDO_PAGE_HEADER_SIZE,
                    cont.data_offset,
                    &cont.bytes,
                ),
                _ => bytes_on_page(UNDO_PAGE_HEADER_SIZE, cont.data_offset, cont.bytes.len()),
            };
            cont.data_offset += n;
            if cont.data_offset == cont.bytes.len() {
                if let Some(close) = pending_close.take() {
                    deliver_close(shared, record, close);
                }
            } else {
                size_cont = Some(cont);
            }
        }

        // New chunk header on this block.
        if bufdata.flags & (URS_XLOG_CREATE | URS_XLOG_ADD_CHUNK) != 0 {
            ensure!(
                matches!(phase, InsertPhase::Idle),
                "corrupted undo buffer data: chunk header while insertion in progress"
            );
            let previous = if bufdata.flags & URS_XLOG_CREATE != 0 {
                UndoRecPtr::INVALID
            } else {
                bufdata.previous_chunk_header_location
            };
            let header = ChunkHeader::new(0, previous, bufdata.urs_type);
            let mut bytes: SmallVec<[u8; 96]> = SmallVec::from_slice(header.as_bytes());
            if bufdata.flags & URS_XLOG_CREATE != 0 {
                bytes.extend_from_slice(&bufdata.type_header);
            }
            chunk_start = block_base + page_offset as u64;
            phase = InsertPhase::Header {
                bytes,
                data_offset: 0,
            };
        }

        // Record body beginning on this block.
        let record_starts_here = bufdata.flags & URS_XLOG_INSERT != 0;
        if record_starts_here && matches!(phase, InsertPhase::Idle) {
            phase = InsertPhase::Record { data_offset: 0 };
        }

        // Apply as much of the insertion stream as fits on this block.
        loop {
            if page_offset >= BLCKSZ {
                break;
            }
            match std::mem::replace(&mut phase, InsertPhase::Idle) {
                InsertPhase::Idle => break,
                InsertPhase::Header {
                    bytes,
                    mut data_offset,
                } => {
                    let n = match entry.as_mut() {
                        Some(e) if !skip => UndoPageMut::new(&mut e.guard[..]).insert_header(
                            page_offset,
                            data_offset,
                            &bytes,
                            chunk_start,
                        ),
                        _ => bytes_on_page(page_offset, data_offset, bytes.len()),
                    };
                    data_offset += n;
                    page_offset += n;
                    if data_offset == bytes.len() {
                        // The record body follows its headers.
                        ensure!(
                            payload.is_some(),
                            "WAL record inserts undo data but none was supplied"
                        );
                        phase = InsertPhase::Record { data_offset: 0 };
                    } else {
                        phase = InsertPhase::Header { bytes, data_offset };
                    }
                }
                InsertPhase::Record { mut data_offset } => {
                    let data = match payload {
                        Some(data) => data,
                        None => {
                            // Close-only records never reach here.
                            eyre::bail!("WAL record inserts undo data but none was supplied")
                        }
                    };
                    if data_offset == 0 {
                        result_begin =
                            Some(UndoRecPtr::new(block.logno, block_base + page_offset as u64));
                    }
                    let n = match entry.as_mut() {
                        Some(e) if !skip => UndoPageMut::new(&mut e.guard[..]).insert_record(
                            page_offset,
                            data_offset,
                            data,
                            chunk_start,
                        ),
                        _ => bytes_on_page(page_offset, data_offset, data.len()),
                    };
                    data_offset += n;
                    page_offset += n;
                    if data_offset == data.len() {
                        insert_end = if page_offset == BLCKSZ {
                            block_base + BLCKSZ as u64 + UNDO_PAGE_HEADER_SIZE as u64
                        } else {
                            block_base + page_offset as u64
                        };
                        break;
                    }
                    phase = InsertPhase::Record { data_offset };
                }
            }
        }

        // Chunk close patch beginning on this block.
        if bufdata.flags & URS_XLOG_CLOSE_CHUNK != 0 {
            let patch_offset = bufdata.chunk_size_page_offset as usize;
            let size_bytes = bufdata.chunk_size.to_le_bytes();

            if bufdata.flags & URS_XLOG_CLOSE != 0
                && UndoSetType::from_u8(bufdata.urs_type)? == UndoSetType::Transaction
                && shared.hook().is_some()
            {
                let header_location = block_base + patch_offset as u64;
                let begin = if bufdata.flags & URS_XLOG_CLOSE_MULTI_CHUNK != 0 {
                    bufdata.first_chunk_header_location
                } else {
                    UndoRecPtr::new(block.logno, header_location)
                };
                pending_close = Some(PendingClose {
                    type_header: bufdata.type_header.clone(),
                    begin,
                    end: UndoRecPtr::new(block.logno, header_location + bufdata.chunk_size),
                });
            }

            let n = match entry.as_mut() {
                Some(e) if !skip => {
                    UndoPageMut::new(&mut e.guard[..]).overwrite(patch_offset, 0, &size_bytes)
                }
                _ => bytes_on_page(patch_offset, 0, size_bytes.len()),
            };
            if n < size_bytes.len() {
                size_cont = Some(SizeCont {
                    bytes: size_bytes,
                    data_offset: n,
                });
            } else if let Some(close) = pending_close.take() {
                // The whole patch landed on one page; the close callback
                // fires once the patch is fully applied.
                deliver_close(shared, record, close);
            }
        }

        if let Some(e) = entry {
            touched.push(e);
        }
    }

    if touched.is_empty() && record.blocks.iter().all(|b| b.kind != BlockKind::Undo) {
        debug!("no registered undo log blocks in record");
    }

    if !matches!(phase, InsertPhase::Idle) || size_cont.is_some() {
        panic!("undo redo ran out of registered blocks with changes pending");
    }

    if let Some(slot) = insert_slot {
        slot.meta().write().insert = insert_end;
    }

    for mut block in touched {
        if !block.restored {
            UndoPageMut::new(&mut block.guard[..]).set_lsn(record.lsn);
            block.frame.mark_dirty();
        }
    }

    Ok(result_begin)
}

/// Derives the commit/prepare disposition of a close from the record
/// carrying it and invokes the transaction undo layer's callback.
fn deliver_close(shared: &UndoShared, record: &WalRecord, close: PendingClose) {
    let (is_commit, is_prepare) = if record.rmgr == RM_XACT {
        match record.info & XACT_OPMASK {
            XACT_COMMIT => (true, false),
            XACT_ABORT => (false, false),
            XACT_PREPARE => (false, true),
            other => panic!(
                "unexpected transaction opcode {:#04x} carrying an undo close",
                other
            ),
        }
    } else if record.rmgr == RM_XLOG && record.info == XLOG_NOOP {
        (false, false)
    } else {
        panic!(
            "unexpected resource manager {} carrying an undo close",
            record.rmgr
        );
    };
    let hook = shared.hook().expect("close parked without a hook");
    hook.on_set_closed(
        &close.type_header,
        close.begin,
        close.end,
        is_commit,
        is_prepare,
    );
}
