//! # Configuration
//!
//! Centralizes the layout constants the rest of the crate derives its
//! arithmetic from, plus the runtime [`EngineConfig`]. Interdependent
//! values are co-located and checked with compile-time assertions so a
//! change to one cannot silently invalidate another.

pub mod constants;

pub use constants::*;

use std::path::{Path, PathBuf};

/// Runtime configuration for an undo engine instance.
///
/// The per-log size cap defaults to the full 1 TiB address space; tests
/// lower it to force a set to spill into a second log.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dir: PathBuf,
    pub log_size: u64,
    pub full_page_images: bool,
}

impl EngineConfig {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            log_size: UNDO_LOG_MAX_SIZE,
            full_page_images: false,
        }
    }

    /// Caps the amount of data a single undo log may hold.
    pub fn log_size(mut self, bytes: u64) -> Self {
        self.log_size = bytes.min(UNDO_LOG_MAX_SIZE);
        self
    }

    /// Attach a full-page image to every modified, previously-written
    /// page registered with a WAL record.
    pub fn full_page_images(mut self, enabled: bool) -> Self {
        self.full_page_images = enabled;
        self
    }
}
