//! # Write-Ahead Log
//!
//! An append-only log of self-describing records. Each record names a
//! resource manager and opcode, registers the buffers it modified
//! (optionally with a full-page image and per-buffer payload bytes), and
//! may carry main data. Records are CRC-64 checksummed; a failed check on
//! read is treated as end-of-log, which is how a torn tail write is
//! discarded after a crash.
//!
//! ## Record Format
//!
//! ```text
//! +----------+----------+----------------------------------------+
//! | len: u32 | crc: u64 | payload (len bytes)                    |
//! +----------+----------+----------------------------------------+
//!
//! payload:
//!   rmgr: u8, info: u8, nblocks: u8, (pad)
//!   nblocks x block header:
//!     block_id, kind, flags, (pad), logno: u32, block: u32,
//!     buf_data_len: u32, image_len: u32
//!   per block: buf_data bytes, then image bytes
//!   main_data_len: u32, main data bytes
//! ```
//!
//! All integers little-endian. An LSN is the stream offset one past the
//! record, so LSNs grow monotonically and stamping a page with a
//! record's LSN orders it after that record.
//!
//! ## Registration Protocol
//!
//! Buffers are registered under caller-chosen block ids, ascending.
//! Registered blocks are tagged with a [`BlockKind`] so that redo can
//! pick the undo blocks out of a record that also touches relation
//! pages owned by the calling access method.

pub mod bufdata;

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::BLCKSZ;
use crate::log::UndoLogNumber;

/// A position in the WAL stream; pages are stamped with the LSN of the
/// last record that touched them.
pub type Lsn = u64;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const RM_XLOG: u8 = 0;
pub const RM_XACT: u8 = 1;

pub const XLOG_NOOP: u8 = 0x20;

pub const XACT_COMMIT: u8 = 0x00;
pub const XACT_ABORT: u8 = 0x20;
pub const XACT_PREPARE: u8 = 0x30;
pub const XACT_OPMASK: u8 = 0x70;

/// The registered page will be fully initialized by redo; no prior
/// content is needed and no full-page image is taken.
pub const REGBUF_WILL_INIT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Undo,
    Relation,
}

impl BlockKind {
    fn as_u8(self) -> u8 {
        match self {
            BlockKind::Undo => 0,
            BlockKind::Relation => 1,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(BlockKind::Undo),
            1 => Ok(BlockKind::Relation),
            other => bail!("unknown WAL block kind {}", other),
        }
    }
}

struct BuilderBlock {
    id: u8,
    kind: BlockKind,
    logno: u32,
    block: u32,
    flags: u8,
    buf_data: Vec<u8>,
    image: Option<Vec<u8>>,
}

/// Accumulates one WAL record before insertion.
#[derive(Default)]
pub struct WalRecordBuilder {
    blocks: Vec<BuilderBlock>,
    main_data: Vec<u8>,
}

impl WalRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an undo log buffer under `block_id`. Ids must be
    /// registered in ascending order and must not repeat.
    pub fn register_undo_buffer(
        &mut self,
        block_id: u8,
        logno: UndoLogNumber,
        block: u32,
        flags: u8,
    ) {
        self.push_block(block_id, BlockKind::Undo, logno, block, flags);
    }

    /// Registers a relation buffer owned by the calling access method.
    pub fn register_rel_buffer(&mut self, block_id: u8, rel_id: u32, block: u32) {
        self.push_block(block_id, BlockKind::Relation, rel_id, block, 0);
    }

    fn push_block(&mut self, id: u8, kind: BlockKind, logno: u32, block: u32, flags: u8) {
        if let Some(last) = self.blocks.last() {
            assert!(last.id < id, "WAL block ids must be registered ascending");
        }
        self.blocks.push(BuilderBlock {
            id,
            kind,
            logno,
            block,
            flags,
            buf_data: Vec::new(),
            image: None,
        });
    }

    /// Appends per-buffer payload bytes to an already registered block.
    pub fn register_buf_data(&mut self, block_id: u8, data: &[u8]) {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.id == block_id)
            .expect("buf data for unregistered WAL block");
        block.buf_data.extend_from_slice(data);
    }

    /// Attaches a full-page image to an already registered block.
    pub fn register_image(&mut self, block_id: u8, page: &[u8]) {
        assert_eq!(page.len(), BLCKSZ);
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.id == block_id)
            .expect("image for unregistered WAL block");
        block.image = Some(page.to_vec());
    }

    /// Appends record main data.
    pub fn register_data(&mut self, data: &[u8]) {
        self.main_data.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.main_data.is_empty()
    }

    fn serialize(&self, rmgr: u8, info: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&[rmgr, info, self.blocks.len() as u8, 0]);
        for block in &self.blocks {
            let header = BlockHeader {
                block_id: block.id,
                kind: block.kind.as_u8(),
                flags: block.flags,
                _reserved: 0,
                logno: U32::new(block.logno),
                block: U32::new(block.block),
                buf_data_len: U32::new(block.buf_data.len() as u32),
                image_len: U32::new(block.image.as_ref().map_or(0, |i| i.len() as u32)),
            };
            out.extend_from_slice(header.as_bytes());
        }
        for block in &self.blocks {
            out.extend_from_slice(&block.buf_data);
            if let Some(image) = &block.image {
                out.extend_from_slice(image);
            }
        }
        out.extend_from_slice(&(self.main_data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.main_data);
        out
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct BlockHeader {
    block_id: u8,
    kind: u8,
    flags: u8,
    _reserved: u8,
    logno: U32,
    block: U32,
    buf_data_len: U32,
    image_len: U32,
}

/// One registered block of a decoded record.
#[derive(Debug, Clone)]
pub struct WalRecordBlock {
    pub id: u8,
    pub kind: BlockKind,
    pub logno: UndoLogNumber,
    pub block: u32,
    pub flags: u8,
    pub buf_data: Vec<u8>,
    pub image: Option<Vec<u8>>,
}

impl WalRecordBlock {
    pub fn will_init(&self) -> bool {
        self.flags & REGBUF_WILL_INIT != 0
    }
}

/// A decoded WAL record.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub rmgr: u8,
    pub info: u8,
    pub blocks: Vec<WalRecordBlock>,
    pub main_data: Vec<u8>,
}

fn decode_payload(payload: &[u8], lsn: Lsn) -> Result<WalRecord> {
    ensure!(payload.len() >= 4, "WAL record payload truncated");
    let rmgr = payload[0];
    let info = payload[1];
    let nblocks = payload[2] as usize;

    let header_size = size_of::<BlockHeader>();
    let mut offset = 4;
    ensure!(
        payload.len() >= offset + nblocks * header_size,
        "WAL record block headers truncated"
    );

    let mut headers = Vec::with_capacity(nblocks);
    for _ in 0..nblocks {
        let header = BlockHeader::ref_from_bytes(&payload[offset..offset + header_size])
            .map_err(|e| eyre::eyre!("invalid WAL block header: {:?}", e))?;
        headers.push((
            header.block_id,
            header.kind,
            header.flags,
            header.logno.get(),
            header.block.get(),
            header.buf_data_len.get() as usize,
            header.image_len.get() as usize,
        ));
        offset += header_size;
    }

    let mut blocks = Vec::with_capacity(nblocks);
    for (id, kind, flags, logno, block, buf_data_len, image_len) in headers {
        ensure!(
            payload.len() >= offset + buf_data_len + image_len,
            "WAL record block data truncated"
        );
        let buf_data = payload[offset..offset + buf_data_len].to_vec();
        offset += buf_data_len;
        let image = if image_len > 0 {
            ensure!(
                image_len == BLCKSZ,
                "full-page image has wrong size {}",
                image_len
            );
            let image = payload[offset..offset + image_len].to_vec();
            offset += image_len;
            Some(image)
        } else {
            None
        };
        blocks.push(WalRecordBlock {
            id,
            kind: BlockKind::from_u8(kind)?,
            logno,
            block,
            flags,
            buf_data,
            image,
        });
    }

    ensure!(payload.len() >= offset + 4, "WAL record main data truncated");
    let main_len = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
    offset += 4;
    ensure!(
        payload.len() >= offset + main_len,
        "WAL record main data truncated"
    );
    let main_data = payload[offset..offset + main_len].to_vec();

    Ok(WalRecord {
        lsn,
        rmgr,
        info,
        blocks,
        main_data,
    })
}

struct WalInner {
    file: File,
    offset: u64,
}

/// The append side of the WAL.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
    full_page_images: bool,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(dir: P, full_page_images: bool) -> Result<Self> {
        let wal_dir = dir.as_ref().join("wal");
        create_dir_all(&wal_dir)
            .wrap_err_with(|| format!("failed to create WAL directory at {:?}", wal_dir))?;
        let path = wal_dir.join("wal.000001");
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open WAL segment at {:?}", path))?;
        let offset = file
            .seek(SeekFrom::End(0))
            .wrap_err("failed to seek WAL segment")?;
        Ok(Self {
            path,
            inner: Mutex::new(WalInner { file, offset }),
            full_page_images,
        })
    }

    /// Whether modified pages should travel with a full-page image.
    pub fn full_page_images(&self) -> bool {
        self.full_page_images
    }

    /// Serializes, checksums, appends, and syncs one record, returning
    /// its LSN.
    pub fn insert(&self, builder: &WalRecordBuilder, rmgr: u8, info: u8) -> Result<Lsn> {
        let payload = builder.serialize(rmgr, info);
        let crc = CRC64.checksum(&payload);

        let mut inner = self.inner.lock();
        inner
            .file
            .write_all(&(payload.len() as u32).to_le_bytes())
            .wrap_err("failed to write WAL record length")?;
        inner
            .file
            .write_all(&crc.to_le_bytes())
            .wrap_err("failed to write WAL record checksum")?;
        inner
            .file
            .write_all(&payload)
            .wrap_err("failed to write WAL record payload")?;
        inner
            .file
            .sync_all()
            .wrap_err("failed to sync WAL record")?;
        inner.offset += 12 + payload.len() as u64;
        Ok(inner.offset)
    }

    /// Reads every valid record from the start of the log. A checksum or
    /// truncation failure ends the iteration, discarding the torn tail.
    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        let mut file = File::open(&self.path)
            .wrap_err_with(|| format!("failed to open WAL segment at {:?}", self.path))?;
        let mut records = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut len_bytes = [0u8; 4];
            match file.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).wrap_err("failed to read WAL record length"),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;

            let mut crc_bytes = [0u8; 8];
            if file.read_exact(&mut crc_bytes).is_err() {
                break;
            }
            let expected = u64::from_le_bytes(crc_bytes);

            let mut payload = vec![0u8; len];
            if file.read_exact(&mut payload).is_err() {
                break;
            }
            if CRC64.checksum(&payload) != expected {
                break;
            }
            offset += 12 + len as u64;
            records.push(decode_payload(&payload, offset)?);
        }
        Ok(records)
    }
}
