//! # Layout Constants
//!
//! All on-disk geometry lives here. The undo address space is carved into
//! fixed-size pages; every page begins with a [`crate::page`] header, and
//! the remainder is "usable bytes". Record pointers advance in usable
//! bytes, so the arithmetic in [`crate::log::address`] depends on the
//! derivations below staying consistent.

// ============================================================================
// PAGE GEOMETRY
// ============================================================================

/// Size of one undo page in bytes. The buffer manager, WAL full-page
/// images, and all offset arithmetic operate on this unit.
pub const BLCKSZ: usize = 8192;

/// Size of the per-page header maintained by the page codec
/// (LSN, insertion point, chunk markers).
pub const UNDO_PAGE_HEADER_SIZE: usize = 24;

/// Data bytes available on a page after the header.
pub const UNDO_USABLE_BYTES_PER_PAGE: usize = BLCKSZ - UNDO_PAGE_HEADER_SIZE;

const _: () = assert!(
    UNDO_USABLE_BYTES_PER_PAGE == BLCKSZ - UNDO_PAGE_HEADER_SIZE,
    "UNDO_USABLE_BYTES_PER_PAGE derivation mismatch"
);

// The close patch overwrites an 8-byte size field that may straddle two
// pages but never three.
const _: () = assert!(
    UNDO_USABLE_BYTES_PER_PAGE >= 8,
    "a page must hold at least one chunk size field"
);

// ============================================================================
// CHUNK LAYOUT
// ============================================================================

/// On-disk size of a chunk header: size (8) + previous chunk pointer (8) +
/// type tag (1) + reserved padding (7).
pub const UNDO_CHUNK_HEADER_SIZE: usize = 24;

/// Upper bound on a registered type header. Matches the fixed staging
/// buffer carried by each record set.
pub const MAX_TYPE_HEADER_SIZE: usize = 64;

// ============================================================================
// LOG ADDRESS SPACE
// ============================================================================

/// Width of an undo log number in a record pointer. 24 bits allows for
/// 16.7M logs over the installation's lifetime.
pub const UNDO_LOG_NUMBER_BITS: u32 = 24;

/// Width of an undo log offset in a record pointer. 40 bits allows for
/// 1 TiB per log.
pub const UNDO_LOG_OFFSET_BITS: u32 = 64 - UNDO_LOG_NUMBER_BITS;

/// The maximum amount of data that can be addressed within one undo log.
pub const UNDO_LOG_MAX_SIZE: u64 = 1 << UNDO_LOG_OFFSET_BITS;

const _: () = assert!(
    UNDO_LOG_NUMBER_BITS + UNDO_LOG_OFFSET_BITS == 64,
    "record pointer fields must pack into 64 bits"
);

// ============================================================================
// PHYSICAL BACKING
// ============================================================================

/// Number of pages an undo log file grows by at a time. 128 pages = 1 MiB.
pub const UNDO_SEGMENT_BLOCKS: usize = 128;

/// Size of one growth step of an undo log file, in bytes.
pub const UNDO_SEGMENT_SIZE: usize = BLCKSZ * UNDO_SEGMENT_BLOCKS;

// ============================================================================
// WAL
// ============================================================================

/// Size of the zeroed filler registered as main data with the synthesized
/// close record, so the record is never empty. Kept at 24 bytes for
/// compatibility with existing WAL streams.
pub const NOOP_FILLER_SIZE: usize = 24;
