//! # Undo Page Codec
//!
//! Serialization primitives for one undo page at a time. Chunk headers,
//! type headers, and record bodies may all straddle page boundaries, so
//! every operation takes the caller's position within the source bytes
//! (`data_offset`) and writes only the portion that fits on this page,
//! returning how many bytes it consumed. Callers loop over pages until
//! the source is exhausted.
//!
//! ## Page Layout
//!
//! ```text
//! +-------------------------------+
//! | UndoPageHeader (24 bytes)     |
//! |  lsn             : u64        |
//! |  insertion_point : u16        |
//! |  first_chunk     : u16        |
//! |  (reserved)      : 4 bytes    |
//! |  continue_chunk  : u64        |
//! +-------------------------------+
//! | chunk headers / type headers / |
//! | record bodies, back to back   |
//! +-------------------------------+
//! ```
//!
//! `insertion_point` is the page offset one past the last byte written;
//! redo uses it to resynchronize the shared insert pointer after a
//! full-page image. `first_chunk` is the page offset of the first chunk
//! header that begins on this page (0 if none does), and `continue_chunk`
//! is the log offset of the chunk header whose payload continues onto
//! this page from an earlier one (0 if the page opens with a chunk
//! header). The crash-recovery scan walks these two fields to find the
//! final chunk of a log without any other state.
//!
//! ## Chunk Header
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  -------------------------------------
//! 0       8     size            0 while the chunk is open
//! 8       8     previous_chunk  pointer to the prior chunk's header,
//!                               invalid for the first chunk of a set
//! 16      1     set_type        registered record set type
//! 17      7     (reserved)
//! ```

use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{BLCKSZ, UNDO_CHUNK_HEADER_SIZE, UNDO_PAGE_HEADER_SIZE};
use crate::log::address::{UndoLogOffset, UndoRecPtr};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UndoPageHeader {
    lsn: U64,
    insertion_point: U16,
    first_chunk: U16,
    _reserved: [u8; 4],
    continue_chunk: U64,
}

impl UndoPageHeader {
    zerocopy_accessors! {
        lsn: u64,
        insertion_point: u16,
        first_chunk: u16,
        continue_chunk: u64,
    }
}

const _: () = assert!(std::mem::size_of::<UndoPageHeader>() == UNDO_PAGE_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ChunkHeader {
    size: U64,
    previous_chunk: U64,
    set_type: u8,
    _reserved: [u8; 7],
}

impl ChunkHeader {
    zerocopy_accessors! {
        size: u64,
        previous_chunk: u64,
    }

    pub fn new(size: u64, previous_chunk: UndoRecPtr, set_type: u8) -> Self {
        Self {
            size: U64::new(size),
            previous_chunk: U64::new(previous_chunk.raw()),
            set_type,
            _reserved: [0; 7],
        }
    }

    pub fn set_type(&self) -> u8 {
        self.set_type
    }

    pub fn parse(bytes: &[u8]) -> eyre::Result<Self> {
        eyre::ensure!(
            bytes.len() >= UNDO_CHUNK_HEADER_SIZE,
            "chunk header truncated: {} < {}",
            bytes.len(),
            UNDO_CHUNK_HEADER_SIZE
        );
        ChunkHeader::read_from_bytes(&bytes[..UNDO_CHUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("invalid chunk header: {:?}", e))
    }
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == UNDO_CHUNK_HEADER_SIZE);

/// How many source bytes fit on this page, starting at `page_offset`,
/// with `data_offset` of `total` already consumed on earlier pages.
///
/// Redo uses this directly to keep its position bookkeeping in sync when
/// a registered block was restored from a full-page image or already
/// discarded and the write itself must be skipped.
pub fn bytes_on_page(page_offset: usize, data_offset: usize, total: usize) -> usize {
    debug_assert!(page_offset >= UNDO_PAGE_HEADER_SIZE && page_offset <= BLCKSZ);
    debug_assert!(data_offset < total);
    (BLCKSZ - page_offset).min(total - data_offset)
}

/// Read-only view of an undo page.
pub struct UndoPageRef<'a> {
    data: &'a [u8],
}

impl<'a> UndoPageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert_eq!(data.len(), BLCKSZ);
        Self { data }
    }

    pub fn header(&self) -> UndoPageHeader {
        UndoPageHeader::read_from_bytes(&self.data[..UNDO_PAGE_HEADER_SIZE])
            .expect("page header layout")
    }

    pub fn bytes(&self, page_offset: usize, len: usize) -> &'a [u8] {
        &self.data[page_offset..page_offset + len]
    }
}

/// Mutable view of an undo page, exposing the codec operations.
pub struct UndoPageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> UndoPageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert_eq!(data.len(), BLCKSZ);
        Self { data }
    }

    fn header_mut(&mut self) -> &mut UndoPageHeader {
        UndoPageHeader::mut_from_bytes(&mut self.data[..UNDO_PAGE_HEADER_SIZE])
            .expect("page header layout")
    }

    pub fn header(&self) -> UndoPageHeader {
        UndoPageHeader::read_from_bytes(&self.data[..UNDO_PAGE_HEADER_SIZE])
            .expect("page header layout")
    }

    /// Zeroes the page and lays in an empty header.
    pub fn init(&mut self) {
        self.data.fill(0);
        self.header_mut()
            .set_insertion_point(UNDO_PAGE_HEADER_SIZE as u16);
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.header_mut().set_lsn(lsn);
    }

    pub fn set_insertion_point(&mut self, offset: u16) {
        self.header_mut().set_insertion_point(offset);
    }

    /// Writes the portion of a chunk header (with any trailing type
    /// header already concatenated by the caller) that fits on this page.
    ///
    /// Starting a header on this page records it in `first_chunk` if it
    /// is the first to do so; continuing one at the top of the page
    /// records the owning chunk in `continue_chunk`.
    pub fn insert_header(
        &mut self,
        page_offset: usize,
        data_offset: usize,
        data: &[u8],
        chunk_start: UndoLogOffset,
    ) -> usize {
        let n = bytes_on_page(page_offset, data_offset, data.len());
        if data_offset == 0 {
            let header = self.header_mut();
            if header.first_chunk() == 0 {
                header.set_first_chunk(page_offset as u16);
            }
        } else if page_offset == UNDO_PAGE_HEADER_SIZE {
            self.header_mut().set_continue_chunk(chunk_start);
        }
        self.data[page_offset..page_offset + n]
            .copy_from_slice(&data[data_offset..data_offset + n]);
        self.header_mut()
            .set_insertion_point((page_offset + n) as u16);
        n
    }

    /// Writes the portion of a record body that fits on this page. A
    /// write starting at the top of the page means the owning chunk
    /// continues from an earlier page, which is recorded in
    /// `continue_chunk`.
    pub fn insert_record(
        &mut self,
        page_offset: usize,
        data_offset: usize,
        data: &[u8],
        chunk_start: UndoLogOffset,
    ) -> usize {
        let n = bytes_on_page(page_offset, data_offset, data.len());
        if page_offset == UNDO_PAGE_HEADER_SIZE {
            self.header_mut().set_continue_chunk(chunk_start);
        }
        self.data[page_offset..page_offset + n]
            .copy_from_slice(&data[data_offset..data_offset + n]);
        self.header_mut()
            .set_insertion_point((page_offset + n) as u16);
        n
    }

    /// Patches previously written bytes in place (the chunk size field on
    /// close). Does not move the insertion point; called once per page
    /// for a patch straddling a boundary.
    pub fn overwrite(&mut self, page_offset: usize, data_offset: usize, data: &[u8]) -> usize {
        let n = bytes_on_page(page_offset, data_offset, data.len());
        self.data[page_offset..page_offset + n]
            .copy_from_slice(&data[data_offset..data_offset + n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::address::UndoRecPtr;

    fn make_page() -> Vec<u8> {
        vec![0u8; BLCKSZ]
    }

    #[test]
    fn init_sets_insertion_point() {
        let mut page = make_page();
        let mut p = UndoPageMut::new(&mut page);
        p.init();
        let header = p.header();
        assert_eq!(header.insertion_point(), UNDO_PAGE_HEADER_SIZE as u16);
        assert_eq!(header.first_chunk(), 0);
        assert_eq!(header.continue_chunk(), 0);
    }

    #[test]
    fn chunk_header_roundtrip() {
        let header = ChunkHeader::new(42, UndoRecPtr::new(3, 1000), 1);
        let parsed = ChunkHeader::parse(header.as_bytes()).unwrap();
        assert_eq!(parsed.size(), 42);
        assert_eq!(parsed.previous_chunk(), UndoRecPtr::new(3, 1000).raw());
        assert_eq!(parsed.set_type(), 1);
    }

    #[test]
    fn insert_header_marks_first_chunk() {
        let mut page = make_page();
        let mut p = UndoPageMut::new(&mut page);
        p.init();
        let header = ChunkHeader::new(0, UndoRecPtr::INVALID, 1);
        let n = p.insert_header(100, 0, header.as_bytes(), 100);
        assert_eq!(n, UNDO_CHUNK_HEADER_SIZE);
        let ph = p.header();
        assert_eq!(ph.first_chunk(), 100);
        assert_eq!(ph.insertion_point() as usize, 100 + UNDO_CHUNK_HEADER_SIZE);
    }

    #[test]
    fn continued_header_marks_continue_chunk() {
        let mut page = make_page();
        let mut p = UndoPageMut::new(&mut page);
        p.init();
        let header = ChunkHeader::new(0, UndoRecPtr::INVALID, 1);
        // Pretend 16 of 24 bytes landed on the previous page.
        let n = p.insert_header(UNDO_PAGE_HEADER_SIZE, 16, header.as_bytes(), 7000);
        assert_eq!(n, 8);
        let ph = p.header();
        assert_eq!(ph.first_chunk(), 0);
        assert_eq!(ph.continue_chunk(), 7000);
    }

    #[test]
    fn record_at_page_top_marks_continue_chunk() {
        let mut page = make_page();
        let mut p = UndoPageMut::new(&mut page);
        p.init();
        let body = [0xAAu8; 64];
        let n = p.insert_record(UNDO_PAGE_HEADER_SIZE, 0, &body, 5000);
        assert_eq!(n, 64);
        assert_eq!(p.header().continue_chunk(), 5000);
    }

    #[test]
    fn record_mid_page_leaves_markers_alone() {
        let mut page = make_page();
        let mut p = UndoPageMut::new(&mut page);
        p.init();
        let body = [0x55u8; 32];
        p.insert_record(200, 0, &body, 5000);
        let ph = p.header();
        assert_eq!(ph.continue_chunk(), 0);
        assert_eq!(ph.insertion_point(), 232);
    }

    #[test]
    fn write_clipped_at_page_end() {
        let mut page = make_page();
        let mut p = UndoPageMut::new(&mut page);
        p.init();
        let body = vec![0x11u8; 100];
        let n = p.insert_record(BLCKSZ - 40, 0, &body, 5000);
        assert_eq!(n, 40);
        assert_eq!(p.header().insertion_point() as usize, BLCKSZ);
    }

    #[test]
    fn overwrite_leaves_insertion_point() {
        let mut page = make_page();
        let mut p = UndoPageMut::new(&mut page);
        p.init();
        p.insert_record(100, 0, &[0u8; 8], 100);
        let before = p.header().insertion_point();
        let patch = 77u64.to_le_bytes();
        let n = p.overwrite(100, 0, &patch);
        assert_eq!(n, 8);
        assert_eq!(p.header().insertion_point(), before);
        assert_eq!(&page[100..108], &patch);
    }

    #[test]
    fn overwrite_straddles_via_two_calls() {
        let mut first = make_page();
        let mut second = make_page();
        let patch = 0x0102_0304_0506_0708u64.to_le_bytes();

        let mut p1 = UndoPageMut::new(&mut first);
        p1.init();
        let n1 = p1.overwrite(BLCKSZ - 3, 0, &patch);
        assert_eq!(n1, 3);

        let mut p2 = UndoPageMut::new(&mut second);
        p2.init();
        let n2 = p2.overwrite(UNDO_PAGE_HEADER_SIZE, n1, &patch);
        assert_eq!(n2, 5);

        assert_eq!(&first[BLCKSZ - 3..], &patch[..3]);
        assert_eq!(
            &second[UNDO_PAGE_HEADER_SIZE..UNDO_PAGE_HEADER_SIZE + 5],
            &patch[3..]
        );
    }

    #[test]
    fn bytes_on_page_clamps_both_ways() {
        assert_eq!(bytes_on_page(BLCKSZ - 10, 0, 100), 10);
        assert_eq!(bytes_on_page(100, 90, 100), 10);
        assert_eq!(bytes_on_page(100, 0, 10), 10);
    }
}
