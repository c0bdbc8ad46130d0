//! State reported by copy operations.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of one copy.
///
/// A copy moves through `Idle → SnapshotCreating → ExtentsResolving →
/// Copying` and ends in `Completed`, `Failed` or `Cancelled`, followed by
/// `SnapshotReleased` once every handle is closed. `SnapshotCreating` is
/// skipped when snapshots are disabled; `SnapshotReleased` is always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    SnapshotCreating,
    ExtentsResolving,
    Copying,
    Completed,
    Failed,
    Cancelled,
    SnapshotReleased,
}

impl Phase {
    /// Whether this phase ends the copy itself (cleanup still follows).
    pub fn is_outcome(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::SnapshotCreating => "creating snapshot",
            Phase::ExtentsResolving => "resolving extents",
            Phase::Copying => "copying",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
            Phase::SnapshotReleased => "snapshot released",
        };
        f.write_str(name)
    }
}

/// Progress of a running copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    /// Bytes transferred so far. Never decreases.
    pub copied_bytes: u64,
    /// Bytes the extent table maps. Fixed for the whole copy.
    pub total_bytes: u64,
    /// `copied_bytes / total_bytes` as a percentage, 0 to 100.
    pub percent: f64,
    /// Average throughput since the transfer started, in bytes per second.
    pub bytes_per_sec: f64,
    /// Estimated time to completion, once a throughput is known.
    pub eta: Option<Duration>,
}

impl ProgressReport {
    /// Compute a report for `copied` of `total` bytes after `elapsed`.
    pub fn compute(copied: u64, total: u64, elapsed: Duration) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            (copied as f64 / total as f64 * 100.0).min(100.0)
        };

        let secs = elapsed.as_secs_f64();
        let bytes_per_sec = if secs > 0.0 { copied as f64 / secs } else { 0.0 };
        let eta = if bytes_per_sec > 0.0 {
            let remaining = total.saturating_sub(copied) as f64;
            Some(Duration::from_secs_f64(remaining / bytes_per_sec))
        } else {
            None
        };

        Self {
            copied_bytes: copied,
            total_bytes: total,
            percent,
            bytes_per_sec,
            eta,
        }
    }
}

/// Result of a successful copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    /// Path the data was actually read from (the snapshot path when a
    /// snapshot was used).
    pub effective_source: PathBuf,

    /// Device the clusters were read from. Empty for fallback copies.
    pub device_path: PathBuf,

    /// Bytes transferred, equal to `total_bytes`.
    pub bytes_copied: u64,

    /// Bytes mapped by the extent table (or the file length for fallback
    /// copies).
    pub total_bytes: u64,

    /// Logical length of the source; the destination is truncated to it.
    pub file_len: u64,

    /// Number of extents, holes included.
    pub extent_count: usize,

    /// Number of hole extents that were zero-filled.
    pub hole_count: usize,

    /// Whether the copy read through a snapshot.
    pub used_snapshot: bool,

    /// Whether the data was read through the regular file API because it is
    /// resident in the MFT.
    pub used_fallback: bool,

    /// Wall time of the whole copy, cleanup included.
    pub elapsed: Duration,
}
