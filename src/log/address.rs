//! # Undo Record Pointers
//!
//! An [`UndoRecPtr`] packs an undo log number (24 bits) and a byte offset
//! within that log (40 bits) into one `u64`. Offsets are raw positions in
//! the log's address space — they include the per-page headers — but
//! pointer arithmetic is done in *usable* bytes: advancing a pointer by
//! `n` steps over `n` data bytes and silently hops the 24-byte header at
//! every page boundary.
//!
//! Offset 0 can never address data (the first page's header lives there),
//! so the all-zero pointer doubles as the invalid value.

use crate::config::{BLCKSZ, UNDO_LOG_NUMBER_BITS, UNDO_LOG_OFFSET_BITS, UNDO_PAGE_HEADER_SIZE};

/// Identifies one undo log.
pub type UndoLogNumber = u32;

/// A raw byte position inside one undo log's address space.
pub type UndoLogOffset = u64;

const OFFSET_MASK: u64 = (1 << UNDO_LOG_OFFSET_BITS) - 1;

/// A pointer to a byte in an undo log: `(logno, offset)` packed into 64
/// bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UndoRecPtr(u64);

impl UndoRecPtr {
    pub const INVALID: UndoRecPtr = UndoRecPtr(0);

    pub fn new(logno: UndoLogNumber, offset: UndoLogOffset) -> Self {
        debug_assert!(u64::from(logno) < (1 << UNDO_LOG_NUMBER_BITS));
        debug_assert!(offset <= OFFSET_MASK);
        Self((u64::from(logno) << UNDO_LOG_OFFSET_BITS) | offset)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn logno(self) -> UndoLogNumber {
        (self.0 >> UNDO_LOG_OFFSET_BITS) as UndoLogNumber
    }

    pub fn offset(self) -> UndoLogOffset {
        self.0 & OFFSET_MASK
    }

    /// The block holding this pointer's byte.
    pub fn block(self) -> u32 {
        block_of(self.offset())
    }

    /// This pointer's position within its page.
    pub fn page_offset(self) -> usize {
        page_offset_of(self.offset())
    }

    /// Advances the pointer by `n` usable bytes.
    pub fn plus_usable_bytes(self, n: usize) -> Self {
        Self::new(self.logno(), offset_plus_usable_bytes(self.offset(), n))
    }
}

impl std::fmt::Display for UndoRecPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// The block holding a given log offset.
pub fn block_of(offset: UndoLogOffset) -> u32 {
    (offset / BLCKSZ as u64) as u32
}

/// A log offset's position within its page.
pub fn page_offset_of(offset: UndoLogOffset) -> usize {
    (offset % BLCKSZ as u64) as usize
}

/// Advances a log offset by `n` usable bytes, skipping the page header at
/// every page boundary. A write that exactly fills a page leaves the
/// offset at the first data byte of the next page.
pub fn offset_plus_usable_bytes(offset: UndoLogOffset, n: usize) -> UndoLogOffset {
    let page_offset = page_offset_of(offset);
    debug_assert!(page_offset >= UNDO_PAGE_HEADER_SIZE || offset == 0);
    let room = BLCKSZ - page_offset;
    if n < room {
        return offset + n as u64;
    }
    let spilled = n - room;
    let full_pages = spilled / (BLCKSZ - UNDO_PAGE_HEADER_SIZE);
    let remainder = spilled % (BLCKSZ - UNDO_PAGE_HEADER_SIZE);
    offset - page_offset as u64
        + (1 + full_pages as u64) * BLCKSZ as u64
        + (UNDO_PAGE_HEADER_SIZE + remainder) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let urp = UndoRecPtr::new(7, 123_456);
        assert_eq!(urp.logno(), 7);
        assert_eq!(urp.offset(), 123_456);
        assert!(urp.is_valid());
    }

    #[test]
    fn invalid_pointer_is_zero() {
        assert!(!UndoRecPtr::INVALID.is_valid());
        assert_eq!(UndoRecPtr::INVALID.raw(), 0);
    }

    #[test]
    fn block_and_page_offset() {
        let urp = UndoRecPtr::new(1, BLCKSZ as u64 * 3 + 100);
        assert_eq!(urp.block(), 3);
        assert_eq!(urp.page_offset(), 100);
    }

    #[test]
    fn usable_advance_within_page() {
        let start = UNDO_PAGE_HEADER_SIZE as u64;
        assert_eq!(offset_plus_usable_bytes(start, 16), start + 16);
    }

    #[test]
    fn usable_advance_exact_page_fill() {
        let start = UNDO_PAGE_HEADER_SIZE as u64;
        let fits = BLCKSZ - UNDO_PAGE_HEADER_SIZE;
        assert_eq!(
            offset_plus_usable_bytes(start, fits),
            BLCKSZ as u64 + UNDO_PAGE_HEADER_SIZE as u64
        );
    }

    #[test]
    fn usable_advance_spills_over_pages() {
        let usable = BLCKSZ - UNDO_PAGE_HEADER_SIZE;
        let start = UNDO_PAGE_HEADER_SIZE as u64;
        // Two full pages and ten more bytes.
        let target = offset_plus_usable_bytes(start, usable * 2 + 10);
        assert_eq!(
            target,
            2 * BLCKSZ as u64 + UNDO_PAGE_HEADER_SIZE as u64 + 10
        );
    }

    #[test]
    fn usable_advance_from_mid_page() {
        let start = 8000u64;
        let room = BLCKSZ as u64 - start;
        let target = offset_plus_usable_bytes(start, room as usize + 5);
        assert_eq!(target, BLCKSZ as u64 + UNDO_PAGE_HEADER_SIZE as u64 + 5);
    }
}
