//! # undoset — Undo Record Set Engine
//!
//! `undoset` is the storage layer that groups related undo records —
//! typically all the undo produced by one transaction at one persistence
//! level — into durable, crash-recoverable *undo record sets*. A set
//! occupies one or more chunks inside pre-allocated, append-only undo
//! logs; every write is covered by a write-ahead log record whose redo
//! reconstructs the pages byte for byte, and a startup sweep closes any
//! set a crash left dangling.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  UndoEngine (per backend)                │
//! │  create / prepare_insert / insert /      │
//! │  prepare_close / mark_closed / destroy   │
//! ├──────────────────────────────────────────┤
//! │  recordset: chunk table, pinned buffer   │
//! │  set, WAL instruction staging, replay,   │
//! │  crash recovery                          │
//! ├─────────────┬──────────────┬─────────────┤
//! │ log         │ buffer       │ wal         │
//! │ allocator,  │ manager,     │ records,    │
//! │ addressing, │ pins, locks, │ buf-data,   │
//! │ mmap files  │ redo reads   │ checksums   │
//! ├─────────────┴──────────────┴─────────────┤
//! │  page: undo page codec                   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use undoset::{EngineConfig, Persistence, UndoEngine, UndoSetType, UndoShared};
//! use undoset::wal::WalRecordBuilder;
//!
//! let shared = UndoShared::open(EngineConfig::new("./data"))?;
//! let mut engine = UndoEngine::new(shared.clone());
//!
//! let set = engine.create(UndoSetType::Transaction, Persistence::Permanent, 1, &42u64.to_le_bytes())?;
//! let location = engine.prepare_insert(set, payload.len())?;
//! let mut record = WalRecordBuilder::new();
//! engine.insert(set, &payload);
//! engine.register_wal_buffers(set, &mut record, 0);
//! let lsn = shared.wal().insert(&record, rmgr, info)?;
//! engine.set_lsn(set, lsn);
//! engine.release(set);
//! // ... at transaction end:
//! engine.close_and_destroy_for_level(1)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and [`EngineConfig`]
//! - [`log`]: undo log allocator, record pointers, backing files
//! - [`page`]: page codec (headers, records, in-place patches)
//! - [`buffer`]: pin/lock/dirty management of undo pages
//! - [`wal`]: WAL records, per-buffer undo instructions
//! - [`recordset`]: the record set engine, redo, crash recovery
//! - [`xact`]: set types and the transaction undo layer's callback

#[macro_use]
mod macros;

pub mod buffer;
pub mod config;
pub mod log;
pub mod page;
pub mod recordset;
pub mod wal;
pub mod xact;

pub use config::EngineConfig;
pub use log::{Persistence, UndoRecPtr};
pub use recordset::recovery::close_dangling_sets;
pub use recordset::replay::replay;
pub use recordset::{UndoEngine, UndoShared, UrsId, UrsState};
pub use xact::{UndoSetType, XactUndoHook};
