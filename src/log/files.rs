//! # Undo Log Files
//!
//! One memory-mapped file per undo log, named `NNNNNN.undo` under the
//! engine's `undo/` directory and grown in whole segments. The buffer
//! manager reads and writes page images through this layer; the log
//! manager extends the physical range ahead of insertions.
//!
//! A freshly created log has zero length; the mmap is established on the
//! first extension. Growing remaps, so page access copies into or out of
//! caller buffers rather than handing out slices that could dangle.

use std::fs::{create_dir_all, read_dir, File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::{BLCKSZ, UNDO_SEGMENT_BLOCKS};
use crate::log::address::UndoLogNumber;

const UNDO_FILE_SUFFIX: &str = ".undo";

struct LogFile {
    file: File,
    mmap: Option<MmapMut>,
    blocks: u32,
}

impl LogFile {
    fn remap(&mut self) -> Result<()> {
        if self.blocks == 0 {
            self.mmap = None;
            return Ok(());
        }
        // SAFETY: the file is created and written only through this
        // process; the map is replaced before any access past the old
        // length and dropped together with the LogFile.
        self.mmap =
            Some(unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to map undo log file")? });
        Ok(())
    }
}

/// The set of physical undo log files backing one engine directory.
pub struct UndoFileSet {
    dir: PathBuf,
    files: Mutex<HashMap<UndoLogNumber, LogFile>>,
}

impl UndoFileSet {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().join("undo");
        create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create undo directory at {:?}", dir))?;

        let mut files = HashMap::new();
        for entry in
            read_dir(&dir).wrap_err_with(|| format!("failed to read undo directory {:?}", dir))?
        {
            let entry = entry.wrap_err("failed to read undo directory entry")?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(UNDO_FILE_SUFFIX) else {
                continue;
            };
            let Ok(logno) = stem.parse::<UndoLogNumber>() else {
                continue;
            };

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(entry.path())
                .wrap_err_with(|| format!("failed to open undo log file {:?}", entry.path()))?;
            let len = file
                .metadata()
                .wrap_err("failed to stat undo log file")?
                .len();
            ensure!(
                len % BLCKSZ as u64 == 0,
                "undo log file {:?} size {} is not a multiple of page size {}",
                entry.path(),
                len,
                BLCKSZ
            );

            let mut log_file = LogFile {
                file,
                mmap: None,
                blocks: (len / BLCKSZ as u64) as u32,
            };
            log_file.remap()?;
            files.insert(logno, log_file);
        }

        Ok(Self {
            dir,
            files: Mutex::new(files),
        })
    }

    fn path_for(&self, logno: UndoLogNumber) -> PathBuf {
        self.dir.join(format!("{:06}{}", logno, UNDO_FILE_SUFFIX))
    }

    /// Creates the file for a new undo log. The file starts empty and is
    /// extended on first use.
    pub fn create(&self, logno: UndoLogNumber) -> Result<()> {
        let path = self.path_for(logno);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create undo log file {:?}", path))?;
        self.files.lock().insert(
            logno,
            LogFile {
                file,
                mmap: None,
                blocks: 0,
            },
        );
        Ok(())
    }

    /// Extends the file for `logno` so it covers at least `blocks` pages,
    /// rounding up to whole segments. Never shrinks.
    pub fn ensure_blocks(&self, logno: UndoLogNumber, blocks: u32) -> Result<u32> {
        let mut files = self.files.lock();
        let log_file = files
            .get_mut(&logno)
            .ok_or_else(|| eyre::eyre!("no file for undo log {}", logno))?;
        if blocks <= log_file.blocks {
            return Ok(log_file.blocks);
        }

        let new_blocks =
            blocks.div_ceil(UNDO_SEGMENT_BLOCKS as u32) * UNDO_SEGMENT_BLOCKS as u32;
        if let Some(mmap) = log_file.mmap.take() {
            mmap.flush()
                .wrap_err("failed to flush undo log before grow")?;
        }
        log_file
            .file
            .set_len(new_blocks as u64 * BLCKSZ as u64)
            .wrap_err_with(|| format!("failed to extend undo log {} to {} pages", logno, new_blocks))?;
        log_file.blocks = new_blocks;
        log_file.remap()?;
        Ok(new_blocks)
    }

    /// Number of pages currently backed for `logno`; 0 for unknown logs.
    pub fn blocks(&self, logno: UndoLogNumber) -> u32 {
        self.files.lock().get(&logno).map_or(0, |f| f.blocks)
    }

    /// Every log number with a backing file, in ascending order.
    pub fn known_logs(&self) -> Vec<UndoLogNumber> {
        let mut logs: Vec<_> = self.files.lock().keys().copied().collect();
        logs.sort_unstable();
        logs
    }

    pub fn read_page(&self, logno: UndoLogNumber, block: u32, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), BLCKSZ);
        let files = self.files.lock();
        let log_file = files
            .get(&logno)
            .ok_or_else(|| eyre::eyre!("no file for undo log {}", logno))?;
        ensure!(
            block < log_file.blocks,
            "page {} of undo log {} is beyond its physical range ({} pages)",
            block,
            logno,
            log_file.blocks
        );
        let mmap = log_file.mmap.as_ref().expect("non-empty log has no map");
        let start = block as usize * BLCKSZ;
        out.copy_from_slice(&mmap[start..start + BLCKSZ]);
        Ok(())
    }

    pub fn write_page(&self, logno: UndoLogNumber, block: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), BLCKSZ);
        let mut files = self.files.lock();
        let log_file = files
            .get_mut(&logno)
            .ok_or_else(|| eyre::eyre!("no file for undo log {}", logno))?;
        ensure!(
            block < log_file.blocks,
            "page {} of undo log {} is beyond its physical range ({} pages)",
            block,
            logno,
            log_file.blocks
        );
        let mmap = log_file.mmap.as_mut().expect("non-empty log has no map");
        let start = block as usize * BLCKSZ;
        mmap[start..start + BLCKSZ].copy_from_slice(data);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let files = self.files.lock();
        for (logno, log_file) in files.iter() {
            if let Some(mmap) = &log_file.mmap {
                mmap.flush()
                    .wrap_err_with(|| format!("failed to sync undo log {}", logno))?;
            }
        }
        Ok(())
    }

    /// The engine directory this file set lives under (without the
    /// trailing `undo/` component).
    pub fn base_dir(&self) -> &Path {
        self.dir.parent().expect("undo directory has a parent")
    }
}
