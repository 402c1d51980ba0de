//! # Undo Record Set Tests
//!
//! End-to-end coverage of the record set write path: creating sets,
//! reserving space, inserting records with WAL coverage, closing, and
//! the chunked on-disk layout that results. Log capacity is lowered in
//! some tests to force a set to spill into a second undo log.
//!
//! ## Layout Expectations
//!
//! A set's first chunk is `chunk_header (24) || type_header || records`;
//! continuation chunks have no type header and point back at the
//! previous chunk's header. An open chunk has size 0 on disk; closing
//! patches the real size in place.

use std::sync::Arc;

use tempfile::tempdir;

use undoset::config::{BLCKSZ, UNDO_CHUNK_HEADER_SIZE, UNDO_PAGE_HEADER_SIZE};
use undoset::page::ChunkHeader;
use undoset::wal::bufdata::{UndoBufData, URS_XLOG_CLOSE_CHUNK, URS_XLOG_CREATE, URS_XLOG_INSERT};
use undoset::wal::{BlockKind, WalRecordBuilder, RM_XACT, RM_XLOG, XACT_COMMIT, XLOG_NOOP};
use undoset::{
    EngineConfig, Persistence, UndoEngine, UndoRecPtr, UndoSetType, UndoShared, UrsId, UrsState,
};

const RM_TESTAM: u8 = 100;
const TESTAM_MOD: u8 = 0;

fn open_engine(config: EngineConfig) -> (Arc<UndoShared>, UndoEngine) {
    let shared = UndoShared::open(config).unwrap();
    let engine = UndoEngine::new(Arc::clone(&shared));
    (shared, engine)
}

/// Runs the full insert protocol for one record and returns the location
/// of its first byte.
fn do_insert(
    engine: &mut UndoEngine,
    shared: &Arc<UndoShared>,
    set: UrsId,
    payload: &[u8],
) -> UndoRecPtr {
    let location = engine.prepare_insert(set, payload.len()).unwrap();
    let mut builder = WalRecordBuilder::new();
    engine.insert(set, payload);
    engine.register_wal_buffers(set, &mut builder, 0);
    let lsn = shared.wal().insert(&builder, RM_TESTAM, TESTAM_MOD).unwrap();
    engine.set_lsn(set, lsn);
    engine.release(set);
    location
}

/// Closes a set on its own commit record and destroys it.
fn do_close(engine: &mut UndoEngine, shared: &Arc<UndoShared>, set: UrsId) {
    if engine.prepare_close(set).unwrap() {
        let mut builder = WalRecordBuilder::new();
        engine.mark_closed(set);
        engine.register_wal_buffers(set, &mut builder, 0);
        let lsn = shared.wal().insert(&builder, RM_XACT, XACT_COMMIT).unwrap();
        engine.set_lsn(set, lsn);
        engine.release(set);
    }
    engine.destroy(set);
}

mod single_chunk_tests {
    use super::*;

    #[test]
    fn simple_insert_and_close() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let type_header = [0x01, 0x02, 0x03, 0x04];
        let set = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &type_header)
            .unwrap();
        let payload: Vec<u8> = (0u8..16).collect();
        let location = do_insert(&mut engine, &shared, set, &payload);

        // The returned pointer is past the chunk header and type header.
        let chunk = engine.chunk_locations(set)[0];
        assert_eq!(
            location,
            chunk.plus_usable_bytes(UNDO_CHUNK_HEADER_SIZE + type_header.len())
        );
        assert_eq!(shared.read_bytes(location, 16).unwrap(), payload);
        assert_eq!(engine.state(set), UrsState::Dirty);

        do_close(&mut engine, &shared, set);

        let header =
            ChunkHeader::parse(&shared.read_bytes(chunk, UNDO_CHUNK_HEADER_SIZE).unwrap()).unwrap();
        assert_eq!(
            header.size(),
            (UNDO_CHUNK_HEADER_SIZE + type_header.len() + 16) as u64
        );
        assert_eq!(header.previous_chunk(), UndoRecPtr::INVALID.raw());
        assert_eq!(header.set_type(), UndoSetType::Foo as u8);

        // The type header sits between the chunk header and the record.
        let stored = shared
            .read_bytes(chunk.plus_usable_bytes(UNDO_CHUNK_HEADER_SIZE), 4)
            .unwrap();
        assert_eq!(stored, type_header);
    }

    #[test]
    fn insert_wal_record_carries_create_and_insert() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let set = engine
            .create(
                UndoSetType::Transaction,
                Persistence::Permanent,
                1,
                &7u64.to_le_bytes(),
            )
            .unwrap();
        do_insert(&mut engine, &shared, set, &[0xAB; 32]);

        let records = shared.wal().read_all().unwrap();
        let record = records.last().unwrap();
        let block = &record.blocks[0];
        assert_eq!(block.kind, BlockKind::Undo);
        let bufdata = UndoBufData::decode(&block.buf_data).unwrap();
        assert_ne!(bufdata.flags & URS_XLOG_INSERT, 0);
        assert_ne!(bufdata.flags & URS_XLOG_CREATE, 0);
        assert_eq!(bufdata.insert_page_offset, UNDO_PAGE_HEADER_SIZE as u16);
        assert_eq!(bufdata.type_header.as_slice(), &7u64.to_le_bytes());

        do_close(&mut engine, &shared, set);
    }

    #[test]
    fn insert_advances_shared_insert_by_usable_bytes() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let set = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[0; 4])
            .unwrap();
        do_insert(&mut engine, &shared, set, &[1; 10]);

        let logno = engine.chunk_locations(set)[0].logno();
        let slot = shared.logs().get_slot(logno).unwrap();
        let insert = slot.meta().read().insert;
        assert_eq!(
            insert,
            (UNDO_PAGE_HEADER_SIZE + UNDO_CHUNK_HEADER_SIZE + 4 + 10) as u64
        );

        // A second record needs no headers at all.
        do_insert(&mut engine, &shared, set, &[2; 10]);
        let insert2 = slot.meta().read().insert;
        assert_eq!(insert2, insert + 10);

        do_close(&mut engine, &shared, set);
    }

    #[test]
    fn record_spanning_pages_is_readable() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let set = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[9; 4])
            .unwrap();
        let payload: Vec<u8> = (0..BLCKSZ * 2 + 100).map(|i| (i % 251) as u8).collect();
        let location = do_insert(&mut engine, &shared, set, &payload);

        assert_eq!(
            shared.read_bytes(location, payload.len()).unwrap(),
            payload
        );
        do_close(&mut engine, &shared, set);
    }

    #[test]
    fn unlogged_set_registers_no_wal_buffers() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let set = engine
            .create(UndoSetType::Foo, Persistence::Unlogged, 1, &[0; 4])
            .unwrap();
        let location = engine.prepare_insert(set, 8).unwrap();
        let mut builder = WalRecordBuilder::new();
        engine.insert(set, &[5; 8]);
        engine.register_wal_buffers(set, &mut builder, 0);
        assert!(builder.is_empty());
        engine.release(set);

        assert_eq!(shared.read_bytes(location, 8).unwrap(), vec![5; 8]);

        // Close without WAL.
        engine.prepare_close(set).unwrap();
        engine.mark_closed(set);
        engine.release(set);
        engine.destroy(set);
    }
}

mod multi_chunk_tests {
    use super::*;

    // A log this small holds one modest record before filling up.
    const SMALL_LOG: u64 = 4096;

    #[test]
    fn full_log_forces_second_chunk() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) =
            open_engine(EngineConfig::new(dir.path()).log_size(SMALL_LOG));

        let set = engine
            .create(
                UndoSetType::Transaction,
                Persistence::Permanent,
                1,
                &11u64.to_le_bytes(),
            )
            .unwrap();

        // Leaves only a handful of bytes before the cap.
        let first = vec![0x11u8; SMALL_LOG as usize - 200];
        do_insert(&mut engine, &shared, set, &first);
        assert_eq!(engine.chunk_locations(set).len(), 1);

        // Does not fit; a second chunk opens in a fresh log.
        let second = vec![0x22u8; 400];
        let location = do_insert(&mut engine, &shared, set, &second);
        let chunks = engine.chunk_locations(set);
        assert_eq!(chunks.len(), 2);
        assert_ne!(chunks[0].logno(), chunks[1].logno());
        assert_eq!(shared.read_bytes(location, 400).unwrap(), second);

        // The abandoned first chunk was closed as part of the same WAL
        // record that created the second.
        let records = shared.wal().read_all().unwrap();
        let record = records.last().unwrap();
        let close_blocks: Vec<_> = record
            .blocks
            .iter()
            .filter(|b| {
                UndoBufData::decode(&b.buf_data)
                    .map(|d| d.flags & URS_XLOG_CLOSE_CHUNK != 0)
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(close_blocks.len(), 1);
        assert_eq!(close_blocks[0].logno, chunks[0].logno());

        let first_header = ChunkHeader::parse(
            &shared
                .read_bytes(chunks[0], UNDO_CHUNK_HEADER_SIZE)
                .unwrap(),
        )
        .unwrap();
        assert!(first_header.size() > 0);

        // The second chunk points back at the first and has no type
        // header of its own.
        let second_header = ChunkHeader::parse(
            &shared
                .read_bytes(chunks[1], UNDO_CHUNK_HEADER_SIZE)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(second_header.previous_chunk(), chunks[0].raw());
        assert_eq!(second_header.size(), 0);
        assert_eq!(
            location,
            chunks[1].plus_usable_bytes(UNDO_CHUNK_HEADER_SIZE)
        );

        do_close(&mut engine, &shared, set);
        let second_header = ChunkHeader::parse(
            &shared
                .read_bytes(chunks[1], UNDO_CHUNK_HEADER_SIZE)
                .unwrap(),
        )
        .unwrap();
        assert!(second_header.size() > 0);
    }

    #[test]
    fn chunk_sizes_cover_the_whole_set() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) =
            open_engine(EngineConfig::new(dir.path()).log_size(SMALL_LOG));

        let set = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[3; 4])
            .unwrap();
        for _ in 0..4 {
            do_insert(&mut engine, &shared, set, &[0x33; 1500]);
        }
        let chunks = engine.chunk_locations(set);
        assert!(chunks.len() >= 2);
        do_close(&mut engine, &shared, set);

        // Every chunk's size equals the insert position reached in its
        // log minus its header offset.
        for chunk in &chunks {
            let header = ChunkHeader::parse(
                &shared.read_bytes(*chunk, UNDO_CHUNK_HEADER_SIZE).unwrap(),
            )
            .unwrap();
            let slot = shared.logs().get_slot(chunk.logno()).unwrap();
            let insert = slot.meta().read().insert;
            assert!(header.size() > 0);
            assert!(chunk.offset() + header.size() <= insert);
        }
    }
}

mod scan_tests {
    use super::*;

    /// Two sets written back to back in one log can be walked from the
    /// log's start using chunk headers alone.
    #[test]
    fn sets_are_locatable_by_chunk_scan() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let set_a = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[0xA0; 4])
            .unwrap();
        do_insert(&mut engine, &shared, set_a, &[0x01; 120]);
        let first = engine.chunk_locations(set_a)[0];
        do_close(&mut engine, &shared, set_a);

        let set_b = engine
            .create(
                UndoSetType::Transaction,
                Persistence::Permanent,
                1,
                &0xBEEFu64.to_le_bytes(),
            )
            .unwrap();
        do_insert(&mut engine, &shared, set_b, &[0x02; 60]);
        do_close(&mut engine, &shared, set_b);

        // Walk: header A, skip its size, land on header B.
        let header_a =
            ChunkHeader::parse(&shared.read_bytes(first, UNDO_CHUNK_HEADER_SIZE).unwrap())
                .unwrap();
        assert_eq!(header_a.set_type(), UndoSetType::Foo as u8);
        let type_a = shared
            .read_bytes(first.plus_usable_bytes(UNDO_CHUNK_HEADER_SIZE), 4)
            .unwrap();
        assert_eq!(type_a, vec![0xA0; 4]);

        let second = UndoRecPtr::new(first.logno(), first.offset() + header_a.size());
        let header_b =
            ChunkHeader::parse(&shared.read_bytes(second, UNDO_CHUNK_HEADER_SIZE).unwrap())
                .unwrap();
        assert_eq!(header_b.set_type(), UndoSetType::Transaction as u8);
        assert_eq!(header_b.previous_chunk(), UndoRecPtr::INVALID.raw());
        let type_b = shared
            .read_bytes(second.plus_usable_bytes(UNDO_CHUNK_HEADER_SIZE), 8)
            .unwrap();
        assert_eq!(type_b, 0xBEEFu64.to_le_bytes());

        // And header B's size lands exactly on the log's insert pointer.
        let slot = shared.logs().get_slot(first.logno()).unwrap();
        assert_eq!(
            second.offset() + header_b.size(),
            slot.meta().read().insert
        );
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn clean_set_destroys_without_close() {
        let dir = tempdir().unwrap();
        let (_shared, mut engine) = open_engine(EngineConfig::new(dir.path()));
        let set = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[0; 4])
            .unwrap();
        assert_eq!(engine.state(set), UrsState::Clean);
        engine.destroy(set);
        assert_eq!(engine.live_sets(), 0);
    }

    #[test]
    #[should_panic(expected = "dirty undo record set not closed")]
    fn dirty_destroy_panics() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));
        let set = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[0; 4])
            .unwrap();
        do_insert(&mut engine, &shared, set, &[1; 8]);
        engine.destroy(set);
    }

    #[test]
    #[should_panic(expected = "not closed before backend exit")]
    fn live_set_at_engine_drop_panics() {
        let dir = tempdir().unwrap();
        let (_shared, mut engine) = open_engine(EngineConfig::new(dir.path()));
        engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[0; 4])
            .unwrap();
        drop(engine);
    }

    #[test]
    fn type_header_size_is_validated() {
        let dir = tempdir().unwrap();
        let (_shared, mut engine) = open_engine(EngineConfig::new(dir.path()));
        assert!(engine
            .create(UndoSetType::Transaction, Persistence::Permanent, 1, &[0; 4])
            .is_err());
        assert!(engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[0; 8])
            .is_err());
    }

    #[test]
    fn close_and_destroy_for_level_writes_noop_record() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let set = engine
            .create(
                UndoSetType::Transaction,
                Persistence::Permanent,
                2,
                &3u64.to_le_bytes(),
            )
            .unwrap();
        do_insert(&mut engine, &shared, set, &[0x44; 20]);

        let did_work = engine.close_and_destroy_for_level(2).unwrap();
        assert!(did_work);
        assert_eq!(engine.live_sets(), 0);

        let records = shared.wal().read_all().unwrap();
        let record = records.last().unwrap();
        assert_eq!(record.rmgr, RM_XLOG);
        assert_eq!(record.info, XLOG_NOOP);
        assert_eq!(record.main_data.len(), 24);
        assert!(record.main_data.iter().all(|&b| b == 0));
    }

    #[test]
    fn level_operations_ignore_shallower_sets() {
        let dir = tempdir().unwrap();
        let (shared, mut engine) = open_engine(EngineConfig::new(dir.path()));

        let outer = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[1; 4])
            .unwrap();
        let inner = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 2, &[2; 4])
            .unwrap();
        do_insert(&mut engine, &shared, outer, &[0x55; 10]);
        do_insert(&mut engine, &shared, inner, &[0x66; 10]);

        // Ending the subtransaction closes only the deeper set.
        engine.close_and_destroy_for_level(2).unwrap();
        assert_eq!(engine.live_sets(), 1);
        assert_eq!(engine.state(outer), UrsState::Dirty);

        engine.close_and_destroy_for_level(1).unwrap();
        assert_eq!(engine.live_sets(), 0);
    }

    #[test]
    fn reset_insertion_forgets_pins() {
        let dir = tempdir().unwrap();
        let (_shared, mut engine) = open_engine(EngineConfig::new(dir.path()));
        let set = engine
            .create(UndoSetType::Foo, Persistence::Permanent, 1, &[0; 4])
            .unwrap();
        engine.prepare_insert(set, 16).unwrap();
        // Simulates an error before the critical section: the abort path
        // forgets the pins and the set is simply destroyed.
        engine.reset_insertion();
        engine.destroy(set);
    }
}
