//! # Undo Buffer Manager
//!
//! Page frames for undo log blocks, keyed by `(logno, block)`. A pin is
//! an `Arc` on the frame; the content lock is the frame's `RwLock`, taken
//! as an owned guard (`arc_lock`) so a record set can pin in one pass and
//! lock in a second pass, then keep the locks across the calls that build
//! a WAL record.
//!
//! The frame table never evicts on its own: the working set of an undo
//! insertion is a handful of pages, and flushing is explicit
//! (checkpoint). `flush` writes dirty frames back through the log file
//! set; dropping the manager without flushing models a crash.
//!
//! ## Read Modes
//!
//! - `Normal`: read the block from the backing file.
//! - `Zero`: return a zeroed frame without touching the file, for pages
//!   about to be written for the first time. The do-side planner uses
//!   this, deliberately deferring the content lock to its second pass.
//! - `ZeroAndLock`: zero the frame and return it already exclusively
//!   locked; a frame that was not resident is published only after the
//!   lock is held, so no other pin ever observes the zeroed page.
//!
//! During redo, [`BufferManager::read_for_redo`] additionally restores a
//! full-page image when the WAL record carries one, telling the caller
//! the block needs no further redo.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::config::BLCKSZ;
use crate::log::files::UndoFileSet;
use crate::log::UndoLogNumber;

/// One page's worth of content.
pub type PageData = Box<[u8; BLCKSZ]>;

/// An owned exclusive content lock on a frame.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageData>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub logno: UndoLogNumber,
    pub block: u32,
}

impl BufferTag {
    pub fn new(logno: UndoLogNumber, block: u32) -> Self {
        Self { logno, block }
    }
}

pub struct Frame {
    tag: BufferTag,
    content: Arc<RwLock<PageData>>,
    dirty: AtomicBool,
}

impl Frame {
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    /// Takes the exclusive content lock as an owned guard.
    pub fn lock_exclusive(&self) -> PageWriteGuard {
        self.content.write_arc()
    }

    /// Runs `f` with a shared borrow of the page content.
    pub fn with_page<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.content.read();
        f(&guard[..])
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Normal,
    Zero,
    ZeroAndLock,
}

/// Outcome of reading a registered block during redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoAction {
    /// The block was read and the redo changes must be applied.
    NeedsRedo,
    /// A full-page image was restored; skip the changes but keep the
    /// position bookkeeping.
    Restored,
}

pub struct BufferManager {
    files: Arc<UndoFileSet>,
    frames: Mutex<HashMap<BufferTag, Arc<Frame>>>,
}

impl BufferManager {
    pub fn new(files: Arc<UndoFileSet>) -> Self {
        Self {
            files,
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Pins the frame for `tag`, reading it according to `mode` if it is
    /// not already resident. `ZeroAndLock` needs the lock taken before
    /// the frame is published and goes through
    /// [`BufferManager::read_buffer_locked`] instead.
    pub fn read_buffer(&self, tag: BufferTag, mode: ReadMode) -> Result<Arc<Frame>> {
        debug_assert!(mode != ReadMode::ZeroAndLock);
        if let Some(frame) = self.frames.lock().get(&tag) {
            return Ok(Arc::clone(frame));
        }

        let mut page: PageData = Box::new([0u8; BLCKSZ]);
        if mode == ReadMode::Normal {
            self.files.read_page(tag.logno, tag.block, &mut page[..])?;
        }
        let frame = Arc::new(Frame {
            tag,
            content: Arc::new(RwLock::new(page)),
            dirty: AtomicBool::new(false),
        });

        let mut frames = self.frames.lock();
        // Lost a race only with ourselves on re-entry; keep the first.
        let entry = frames.entry(tag).or_insert_with(|| Arc::clone(&frame));
        Ok(Arc::clone(entry))
    }

    /// Pins the frame and takes its exclusive content lock in one step.
    /// For `ZeroAndLock` a frame that was not resident is locked before
    /// it becomes visible in the frame table, so the zeroed page can
    /// never be observed by a concurrent pin.
    pub fn read_buffer_locked(
        &self,
        tag: BufferTag,
        mode: ReadMode,
    ) -> Result<(Arc<Frame>, PageWriteGuard)> {
        if mode != ReadMode::ZeroAndLock {
            let frame = self.read_buffer(tag, mode)?;
            let guard = frame.lock_exclusive();
            return Ok((frame, guard));
        }

        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&tag) {
            let frame = Arc::clone(frame);
            drop(frames);
            let guard = frame.lock_exclusive();
            return Ok((frame, guard));
        }
        let frame = Arc::new(Frame {
            tag,
            content: Arc::new(RwLock::new(Box::new([0u8; BLCKSZ]))),
            dirty: AtomicBool::new(false),
        });
        // Uncontended: the frame is not shared yet.
        let guard = frame.lock_exclusive();
        frames.insert(tag, Arc::clone(&frame));
        Ok((frame, guard))
    }

    /// Reads a block for redo, returning it locked. When `image` is
    /// present the page is rebuilt from it, stamped with the record's
    /// LSN, and reported as [`RedoAction::Restored`].
    pub fn read_for_redo(
        &self,
        tag: BufferTag,
        mode: ReadMode,
        image: Option<&[u8]>,
        lsn: u64,
    ) -> Result<(RedoAction, Arc<Frame>, PageWriteGuard)> {
        match image {
            Some(image) => {
                let (frame, mut guard) = self.read_buffer_locked(tag, ReadMode::ZeroAndLock)?;
                guard[..].copy_from_slice(image);
                crate::page::UndoPageMut::new(&mut guard[..]).set_lsn(lsn);
                frame.mark_dirty();
                Ok((RedoAction::Restored, frame, guard))
            }
            None => {
                let (frame, guard) = self.read_buffer_locked(tag, mode)?;
                Ok((RedoAction::NeedsRedo, frame, guard))
            }
        }
    }

    /// Writes every dirty frame back to the log files.
    pub fn flush(&self) -> Result<()> {
        let frames: Vec<Arc<Frame>> = self.frames.lock().values().map(Arc::clone).collect();
        for frame in frames {
            if !frame.is_dirty() {
                continue;
            }
            let tag = frame.tag();
            frame.with_page(|page| self.files.write_page(tag.logno, tag.block, page))?;
            frame.dirty.store(false, Ordering::Relaxed);
        }
        self.files.sync()
    }
}
