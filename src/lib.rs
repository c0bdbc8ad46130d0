//! # rawcopy
//!
//! Copy files that are locked by other processes by reading their clusters
//! straight from the raw NTFS volume.
//!
//! ## Overview
//!
//! A copy resolves the file's extent table (virtual cluster runs mapped to
//! logical clusters on the volume), opens the volume device for unbuffered
//! reads and streams every extent into the destination at its original file
//! offset. By default the volume is snapshotted first so the data is read
//! from a consistent point in time, and the snapshot is always released
//! before the copy returns. This is useful when:
//!
//! - The file is held open with exclusive sharing (registry hives, `ntds.dit`,
//!   page files, database files)
//! - A consistent point-in-time copy of a busy file is needed
//! - The file is sparse and its holes must be reproduced as zeros
//!
//! ## Features
//!
//! - Extent resolution with `FSCTL_GET_RETRIEVAL_POINTERS` on Windows and
//!   `FIEMAP` (via [`blkmap`]) for NTFS mounts on Linux
//! - Shadow copy snapshots with guaranteed release
//! - Sector-aligned Direct I/O reads, optionally across several threads
//! - Progress reporting and cooperative cancellation
//! - Fallback to a regular read for small files resident in the MFT
//!
//! ## Example
//!
//! ```no_run
//! use rawcopy::{copy, CancelToken, CopyJob, NativeVolume, NoProgress, Options};
//!
//! let job = CopyJob::new(
//!     r"C:\Windows\System32\config\SYSTEM",
//!     r"D:\backup\SYSTEM",
//!     Options::new().with_buffer_size_kb(4096),
//! );
//! let result = copy(&NativeVolume::default(), &job, &NoProgress, &CancelToken::new()).unwrap();
//! println!(
//!     "copied {} bytes in {} extents from {}",
//!     result.bytes_copied,
//!     result.extent_count,
//!     result.device_path.display()
//! );
//! ```
//!
//! ## Safety
//!
//! Opening a volume device requires administrator (or root) privileges. The
//! CLI tool requests them when needed on Unix.

mod cancel;
mod copier;
mod device;
mod error;
mod extent;
mod options;
pub mod platform;
mod progress;
mod snapshot;
mod state;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use copier::{copy, CopyJob};
#[cfg(any(windows, target_os = "linux"))]
pub use copier::RawCopy;
pub use device::{open_unbuffered, AlignedBuffer, BlockDevice, RawVolume};
pub use error::{Error, ErrorKind, Result};
pub use extent::{
    resolve_extents, Extent, ExtentTable, QueryStatus, RetrievalPointerQuery, RetrievalPointers,
    RetrievalRun,
};
pub use options::Options;
#[cfg(any(windows, target_os = "linux"))]
pub use platform::NativeVolume;
pub use platform::{inspect, ExtentReport, Volume, VolumeInfo};
pub use progress::{NoProgress, Progress};
pub use snapshot::{describe_return_value, ShadowCopyProvider, Snapshot, SnapshotGuard, SnapshotProvider};
pub use state::{CopyResult, Phase, ProgressReport};
