//! # Undo Log Layer
//!
//! An undo log is a 1 TiB append-only address space identified by a small
//! integer. Each log exposes a monotonically advancing `insert` pointer, a
//! lower bound `discard` below which data is gone, and a physical bound
//! `end` up to which the backing file has been extended. Record sets
//! above this layer consume logs one at a time; within one log, sets
//! never interleave.
//!
//! - [`address`]: record pointer packing and usable-byte arithmetic
//! - [`files`]: memory-mapped per-log backing files
//! - [`manager`]: slot lifecycle, freelists, physical extension,
//!   metadata checkpoints

pub mod address;
pub mod files;
pub mod manager;

pub use address::{
    block_of, offset_plus_usable_bytes, page_offset_of, UndoLogNumber, UndoLogOffset, UndoRecPtr,
};
pub use files::UndoFileSet;
pub use manager::{Persistence, UndoLogManager, UndoLogMeta, UndoLogSlot};
