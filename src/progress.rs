//! Progress reporting hooks.

use crate::state::{Phase, ProgressReport};

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Receives progress from a running copy.
///
/// Callbacks are informational: nothing they do changes the control flow of
/// the copy, except through a [`CancelToken`](crate::CancelToken) they may
/// hold. Calls to `on_progress` are serialized, and `copied_bytes` never
/// decreases from one report to the next, even with several copy threads.
pub trait Progress: Send + Sync {
    /// The copy entered `phase`.
    fn on_phase(&self, _phase: Phase) {}

    /// The transfer is about to start and will move `total_bytes`.
    fn on_start(&self, _total_bytes: u64) {}

    /// A buffer was written to the destination.
    fn on_progress(&self, report: &ProgressReport);
}

/// Discards every progress callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn on_progress(&self, _report: &ProgressReport) {}
}

/// Byte counter shared by the copy workers.
///
/// The counter lock is held while the report is delivered, so reports reach
/// the collaborator in counter order.
pub(crate) struct Transfer<'a> {
    total: u64,
    copied: Mutex<u64>,
    started: Instant,
    progress: &'a dyn Progress,
}

impl<'a> Transfer<'a> {
    pub(crate) fn start(total: u64, progress: &'a dyn Progress) -> Self {
        progress.on_start(total);
        Self {
            total,
            copied: Mutex::new(0),
            started: Instant::now(),
            progress,
        }
    }

    /// Account for `bytes` more bytes and emit a progress report.
    pub(crate) fn advance(&self, bytes: u64) {
        let mut copied = self.lock();
        *copied += bytes;
        let report = ProgressReport::compute(*copied, self.total, self.started.elapsed());
        self.progress.on_progress(&report);
    }

    pub(crate) fn copied(&self) -> u64 {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        // A panicking callback leaves the count itself intact.
        self.copied.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}
