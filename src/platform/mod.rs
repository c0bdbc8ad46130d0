//! Operating system backends.
//!
//! A [`Volume`] answers everything the copy engine needs to know about the
//! volume holding the source file: its geometry, the file's extent table,
//! how to open the raw device and how to snapshot it.

use crate::device::BlockDevice;
use crate::error::Result;
use crate::extent::ExtentTable;
use crate::options::BUFFER_ALIGNMENT;
use crate::snapshot::{Snapshot, SnapshotProvider};

use std::io::Read;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::LinuxVolume;
#[cfg(windows)]
pub use windows::WindowsVolume;

/// The backend for the current operating system.
#[cfg(target_os = "linux")]
pub type NativeVolume = LinuxVolume;

/// The backend for the current operating system.
#[cfg(windows)]
pub type NativeVolume = WindowsVolume;

/// Geometry of the volume holding a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Mount point of the volume, e.g. `C:\`.
    pub root: PathBuf,
    /// Raw device of the live volume.
    pub device_path: PathBuf,
    /// Bytes per cluster.
    pub cluster_size: u64,
    /// Bytes per sector of the device.
    pub sector_size: u64,
}

impl VolumeInfo {
    /// Alignment of transfer buffers, in memory and in length: the larger of
    /// the sector size and [`BUFFER_ALIGNMENT`]. Device offsets only need
    /// sector alignment.
    pub fn buffer_alignment(&self) -> u64 {
        self.sector_size.max(BUFFER_ALIGNMENT as u64)
    }
}

/// Access to the volume behind a source file.
pub trait Volume: SnapshotProvider {
    /// Handle used to query a file's extents.
    type Source;
    /// Handle used for regular reads of resident files.
    type Reader: Read;
    /// Raw device handle.
    type Device: BlockDevice;

    /// Look up the volume holding `path`.
    fn describe(&self, path: &Path) -> Result<VolumeInfo>;

    /// Open `path` for extent queries.
    fn open_source(&self, path: &Path) -> Result<Self::Source>;

    /// Logical length of an opened source.
    fn source_len(&self, source: &Self::Source) -> Result<u64>;

    /// Resolve the extent table of an opened source.
    fn resolve_extents(&self, source: &Self::Source, info: &VolumeInfo) -> Result<ExtentTable>;

    /// Open `path` for regular reads.
    fn open_reader(&self, path: &Path) -> Result<Self::Reader>;

    /// Open the raw device at `path`.
    fn open_device(&self, path: &Path) -> Result<Self::Device>;

    /// Map a path on the live volume into `snapshot`.
    fn snapshot_path(&self, snapshot: &Snapshot, path: &Path) -> Result<PathBuf> {
        snapshot.translate(path)
    }
}

/// Volume geometry and extent table of one file.
#[derive(Debug, Clone)]
pub struct ExtentReport {
    pub info: VolumeInfo,
    pub file_len: u64,
    pub table: ExtentTable,
}

/// Resolve the extents of `path` on the live volume without copying.
pub fn inspect<V: Volume>(volume: &V, path: &Path) -> Result<ExtentReport> {
    let info = volume.describe(path)?;
    let source = volume.open_source(path)?;
    let file_len = volume.source_len(&source)?;
    let table = volume.resolve_extents(&source, &info)?;
    Ok(ExtentReport {
        info,
        file_len,
        table,
    })
}
