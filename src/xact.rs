//! # Record Set Types
//!
//! Every record set carries a one-byte type tag that determines the size
//! of the type header stored in the set's first chunk and which consumer
//! is notified when the set closes. The transaction undo layer owns the
//! `Transaction` type; `Foo` is a tiny second type kept for exercising
//! the type registry.

use eyre::{bail, Result};

use crate::log::UndoRecPtr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UndoSetType {
    /// All undo written by one transaction at one persistence level. The
    /// 8-byte type header is the transaction id.
    Transaction = 1,
    /// Test type with a 4-byte header.
    Foo = 2,
}

impl UndoSetType {
    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(UndoSetType::Transaction),
            2 => Ok(UndoSetType::Foo),
            other => bail!("unknown undo record set type {}", other),
        }
    }

    /// Size of the type header stored after the first chunk header.
    pub fn type_header_size(self) -> usize {
        match self {
            UndoSetType::Transaction => 8,
            UndoSetType::Foo => 4,
        }
    }
}

/// Callback surface of the transaction undo layer.
///
/// Replay and crash recovery invoke this when a `Transaction` set is
/// closed, passing the verbatim type header and the set's byte range.
/// For a close carried by a commit/abort/prepare record the flags
/// reflect that record; a close synthesized at crash recovery reports
/// neither commit nor prepare.
pub trait XactUndoHook: Send + Sync {
    fn on_set_closed(
        &self,
        type_header: &[u8],
        begin: UndoRecPtr,
        end: UndoRecPtr,
        is_commit: bool,
        is_prepare: bool,
    );
}
