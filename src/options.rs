//! Configuration options for raw copy operations.

use crate::error::{Error, Result};
use std::time::Duration;

/// Smallest accepted buffer size, in KiB.
pub const MIN_BUFFER_SIZE_KB: u32 = 4;

/// Largest accepted buffer size, in KiB.
pub const MAX_BUFFER_SIZE_KB: u32 = 40960;

/// Every buffer size must be a multiple of this many bytes.
pub const BUFFER_ALIGNMENT: usize = 4096;

const DEFAULT_BUFFER_SIZE_KB: u32 = 1024;

/// Options for controlling the copy behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Size of the transfer buffer in bytes.
    ///
    /// Must be a positive multiple of [`BUFFER_ALIGNMENT`] between
    /// [`MIN_BUFFER_SIZE_KB`] and [`MAX_BUFFER_SIZE_KB`] KiB.
    pub buffer_size: usize,

    /// Replace an existing destination.
    ///
    /// When disabled (default), an existing destination fails the copy
    /// before the source is touched.
    pub overwrite: bool,

    /// Read through a point-in-time snapshot of the source volume.
    ///
    /// When disabled, extents are resolved and read against the live
    /// volume device, and a file modified during the copy may come out torn.
    pub use_snapshot: bool,

    /// Allow fallback to a regular read for resident files.
    ///
    /// NTFS keeps small files inside their MFT record, so they have no
    /// extents to read. When enabled, such files are copied through the
    /// normal file API (through the snapshot when one is active). When
    /// disabled (default), they fail with an unsupported file system error.
    pub allow_fallback: bool,

    /// Number of extents copied concurrently.
    ///
    /// `1` (default) copies extents in order on the calling thread.
    pub threads: usize,

    /// Fail any single device read that takes longer than this.
    pub read_timeout: Option<Duration>,

    /// Dry run mode - skip device reads and destination writes.
    ///
    /// The snapshot is still created and the extents still resolved, so a
    /// dry run validates that the file can be copied without moving data.
    pub dry_run: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE_KB as usize * 1024,
            overwrite: false,
            use_snapshot: true,
            allow_fallback: false,
            threads: 1,
            read_timeout: None,
            dry_run: false,
        }
    }
}

impl Options {
    /// Create a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transfer buffer size in KiB.
    pub fn with_buffer_size_kb(mut self, kb: u32) -> Self {
        self.buffer_size = kb as usize * 1024;
        self
    }

    /// Enable or disable overwriting an existing destination.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Enable or disable reading through a volume snapshot.
    pub fn with_snapshot(mut self, enable: bool) -> Self {
        self.use_snapshot = enable;
        self
    }

    /// Enable or disable the regular-read fallback for resident files.
    pub fn with_allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }

    /// Set the number of extents copied concurrently.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set a per-read timeout for device reads.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enable or disable dry run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Check the options before any work starts.
    pub fn validate(&self) -> Result<()> {
        let min = MIN_BUFFER_SIZE_KB as usize * 1024;
        let max = MAX_BUFFER_SIZE_KB as usize * 1024;
        if self.buffer_size < min || self.buffer_size > max {
            return Err(Error::InvalidConfig(format!(
                "buffer size must be between {} and {} KiB, got {} bytes",
                MIN_BUFFER_SIZE_KB, MAX_BUFFER_SIZE_KB, self.buffer_size
            )));
        }
        if self.buffer_size % BUFFER_ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(format!(
                "buffer size must be a multiple of {} bytes, got {}",
                BUFFER_ALIGNMENT, self.buffer_size
            )));
        }
        if self.threads == 0 {
            return Err(Error::InvalidConfig(
                "thread count must be at least 1".to_string(),
            ));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig(
                "read timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
