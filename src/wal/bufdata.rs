//! # Per-Buffer Undo Instructions
//!
//! The undo engine attaches a small instruction packet to each buffer it
//! registers with a WAL record. The packet is a flags byte followed by
//! the fields the set flags call for, in a fixed order, all
//! little-endian. The encoding is part of the on-disk WAL format and must
//! stay stable.
//!
//! ```text
//! flags: u8
//! URS_XLOG_INSERT            -> insert_page_offset: u16
//! URS_XLOG_ADD_PAGE          -> chunk_header_location: u64
//! URS_XLOG_ADD_CHUNK         -> previous_chunk_header_location: u64
//! CREATE|ADD_CHUNK|ADD_PAGE
//!   |CLOSE                   -> urs_type: u8
//! CREATE|CLOSE               -> type_header_size: u8, type_header bytes
//! URS_XLOG_CLOSE_CHUNK       -> chunk_size_page_offset: u16, chunk_size: u64
//! URS_XLOG_CLOSE_MULTI_CHUNK -> first_chunk_header_location: u64
//! ```

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::MAX_TYPE_HEADER_SIZE;
use crate::log::UndoRecPtr;

/// A record insertion begins on this page at `insert_page_offset`.
pub const URS_XLOG_INSERT: u8 = 0x01;
/// The first chunk of a new record set begins here; carries the type and
/// the verbatim type header.
pub const URS_XLOG_CREATE: u8 = 0x02;
/// A continuation chunk begins here; carries the previous chunk's header
/// location.
pub const URS_XLOG_ADD_CHUNK: u8 = 0x04;
/// This page continues a chunk that started on an earlier page; carries
/// the owning chunk's header location.
pub const URS_XLOG_ADD_PAGE: u8 = 0x08;
/// The chunk whose header sits at `chunk_size_page_offset` on this page
/// is being closed with `chunk_size`.
pub const URS_XLOG_CLOSE_CHUNK: u8 = 0x10;
/// The close also closes the whole record set.
pub const URS_XLOG_CLOSE: u8 = 0x20;
/// The closed set has more than one chunk; carries the first chunk's
/// header location.
pub const URS_XLOG_CLOSE_MULTI_CHUNK: u8 = 0x40;

const CARRIES_TYPE: u8 =
    URS_XLOG_CREATE | URS_XLOG_ADD_CHUNK | URS_XLOG_ADD_PAGE | URS_XLOG_CLOSE;
const CARRIES_TYPE_HEADER: u8 = URS_XLOG_CREATE | URS_XLOG_CLOSE;

/// Decoded (or to-be-encoded) per-buffer instructions.
#[derive(Debug, Clone, Default)]
pub struct UndoBufData {
    pub flags: u8,
    pub insert_page_offset: u16,
    pub chunk_header_location: UndoRecPtr,
    pub previous_chunk_header_location: UndoRecPtr,
    pub urs_type: u8,
    pub type_header: SmallVec<[u8; MAX_TYPE_HEADER_SIZE]>,
    pub chunk_size_page_offset: u16,
    pub chunk_size: u64,
    pub first_chunk_header_location: UndoRecPtr,
}

impl UndoBufData {
    pub fn is_empty(&self) -> bool {
        self.flags == 0
    }

    pub fn encode(&self) -> SmallVec<[u8; 128]> {
        let mut out = SmallVec::new();
        out.push(self.flags);
        if self.flags & URS_XLOG_INSERT != 0 {
            out.extend_from_slice(&self.insert_page_offset.to_le_bytes());
        }
        if self.flags & URS_XLOG_ADD_PAGE != 0 {
            out.extend_from_slice(&self.chunk_header_location.raw().to_le_bytes());
        }
        if self.flags & URS_XLOG_ADD_CHUNK != 0 {
            out.extend_from_slice(&self.previous_chunk_header_location.raw().to_le_bytes());
        }
        if self.flags & CARRIES_TYPE != 0 {
            out.push(self.urs_type);
        }
        if self.flags & CARRIES_TYPE_HEADER != 0 {
            debug_assert!(self.type_header.len() <= MAX_TYPE_HEADER_SIZE);
            out.push(self.type_header.len() as u8);
            out.extend_from_slice(&self.type_header);
        }
        if self.flags & URS_XLOG_CLOSE_CHUNK != 0 {
            out.extend_from_slice(&self.chunk_size_page_offset.to_le_bytes());
            out.extend_from_slice(&self.chunk_size.to_le_bytes());
        }
        if self.flags & URS_XLOG_CLOSE_MULTI_CHUNK != 0 {
            out.extend_from_slice(&self.first_chunk_header_location.raw().to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut cursor = Cursor { bytes, pos: 0 };
        let flags = cursor.u8()?;
        let mut out = UndoBufData {
            flags,
            ..Default::default()
        };
        if flags & URS_XLOG_INSERT != 0 {
            out.insert_page_offset = cursor.u16()?;
        }
        if flags & URS_XLOG_ADD_PAGE != 0 {
            out.chunk_header_location = UndoRecPtr::from_raw(cursor.u64()?);
        }
        if flags & URS_XLOG_ADD_CHUNK != 0 {
            out.previous_chunk_header_location = UndoRecPtr::from_raw(cursor.u64()?);
        }
        if flags & CARRIES_TYPE != 0 {
            out.urs_type = cursor.u8()?;
        }
        if flags & CARRIES_TYPE_HEADER != 0 {
            let len = cursor.u8()? as usize;
            ensure!(
                len <= MAX_TYPE_HEADER_SIZE,
                "corrupted undo buffer data: type header of {} bytes",
                len
            );
            out.type_header = SmallVec::from_slice(cursor.take(len)?);
        }
        if flags & URS_XLOG_CLOSE_CHUNK != 0 {
            out.chunk_size_page_offset = cursor.u16()?;
            out.chunk_size = cursor.u64()?;
        }
        if flags & URS_XLOG_CLOSE_MULTI_CHUNK != 0 {
            out.first_chunk_header_location = UndoRecPtr::from_raw(cursor.u64()?);
        }
        ensure!(
            cursor.pos == bytes.len(),
            "corrupted undo buffer data: {} trailing bytes",
            bytes.len() - cursor.pos
        );
        Ok(out)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.bytes.len(),
            "corrupted undo buffer data: truncated at byte {}",
            self.pos
        );
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_decodes_to_no_flags() {
        let decoded = UndoBufData::decode(&[]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn create_roundtrip() {
        let data = UndoBufData {
            flags: URS_XLOG_INSERT | URS_XLOG_CREATE,
            insert_page_offset: 24,
            urs_type: 1,
            type_header: SmallVec::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]),
            ..Default::default()
        };
        let decoded = UndoBufData::decode(&data.encode()).unwrap();
        assert_eq!(decoded.flags, data.flags);
        assert_eq!(decoded.insert_page_offset, 24);
        assert_eq!(decoded.urs_type, 1);
        assert_eq!(decoded.type_header.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn close_multi_chunk_roundtrip() {
        let data = UndoBufData {
            flags: URS_XLOG_CLOSE_CHUNK | URS_XLOG_CLOSE | URS_XLOG_CLOSE_MULTI_CHUNK,
            urs_type: 1,
            type_header: SmallVec::from_slice(&42u64.to_le_bytes()),
            chunk_size_page_offset: 8189,
            chunk_size: 12345,
            first_chunk_header_location: UndoRecPtr::new(1, 24),
            ..Default::default()
        };
        let decoded = UndoBufData::decode(&data.encode()).unwrap();
        assert_eq!(decoded.chunk_size_page_offset, 8189);
        assert_eq!(decoded.chunk_size, 12345);
        assert_eq!(
            decoded.first_chunk_header_location,
            UndoRecPtr::new(1, 24)
        );
    }

    #[test]
    fn add_chunk_and_add_page_roundtrip() {
        let data = UndoBufData {
            flags: URS_XLOG_ADD_CHUNK | URS_XLOG_ADD_PAGE,
            chunk_header_location: UndoRecPtr::new(2, 24),
            previous_chunk_header_location: UndoRecPtr::new(1, 24),
            urs_type: 2,
            ..Default::default()
        };
        let decoded = UndoBufData::decode(&data.encode()).unwrap();
        assert_eq!(decoded.chunk_header_location, UndoRecPtr::new(2, 24));
        assert_eq!(
            decoded.previous_chunk_header_location,
            UndoRecPtr::new(1, 24)
        );
        assert_eq!(decoded.urs_type, 2);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let data = UndoBufData {
            flags: URS_XLOG_CLOSE_CHUNK,
            chunk_size_page_offset: 100,
            chunk_size: 7,
            ..Default::default()
        };
        let mut bytes = data.encode().to_vec();
        bytes.truncate(bytes.len() - 2);
        assert!(UndoBufData::decode(&bytes).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let data = UndoBufData {
            flags: URS_XLOG_INSERT,
            insert_page_offset: 24,
            ..Default::default()
        };
        let mut bytes = data.encode().to_vec();
        bytes.push(0xFF);
        assert!(UndoBufData::decode(&bytes).is_err());
    }
}
