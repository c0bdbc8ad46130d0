//! Linux backend for NTFS volumes mounted by the in-kernel drivers
//! (`ntfs3` or the legacy `ntfs`).
//!
//! Extents are queried with `FIEMAP` through [`blkmap`] and the block device
//! is found through [`blkpath`]. Linux has no shadow copy service, so copies
//! on this backend must run with snapshots disabled.

use crate::device::open_unbuffered;
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentTable};
use crate::platform::{Volume, VolumeInfo};
use crate::snapshot::{Snapshot, SnapshotProvider};

use blkmap::{Fiemap, FiemapExtent};
use blkpath::ResolveDevice;

use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const NTFS_SB_MAGIC: u64 = 0x5346_544e;
const NTFS3_SUPER_MAGIC: u64 = 0x7366_746e;

/// `_IO(0x12, 104)`: logical sector size of a block device.
const BLKSSZGET: libc::c_ulong = 0x1268;

/// NTFS volumes mounted on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxVolume;

impl LinuxVolume {
    pub fn new() -> Self {
        Self
    }
}

/// A source file opened for extent queries.
#[derive(Debug)]
pub struct SourceFile {
    file: File,
    path: PathBuf,
}

fn fstatfs(file: &File) -> io::Result<libc::statfs> {
    let mut stat = MaybeUninit::<libc::statfs>::zeroed();
    // SAFETY: stat points to writable memory of the right size.
    let rc = unsafe { libc::fstatfs(file.as_raw_fd(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstatfs succeeded and filled the struct.
    Ok(unsafe { stat.assume_init() })
}

fn logical_sector_size(device_path: &Path) -> Result<u64> {
    let device = File::open(device_path).map_err(|source| Error::VolumeOpenFailed {
        path: device_path.to_path_buf(),
        source,
    })?;
    let mut size: libc::c_int = 0;
    // SAFETY: BLKSSZGET writes a single c_int.
    let rc = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            BLKSSZGET as _,
            &mut size as *mut libc::c_int,
        )
    };
    if rc != 0 || size <= 0 {
        return Err(Error::VolumeOpenFailed {
            path: device_path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(size as u64)
}

/// Walk up from `path` to the last ancestor on the same device.
fn mount_root(path: &Path) -> io::Result<PathBuf> {
    let canonical = path.canonicalize()?;
    let dev = canonical.metadata()?.dev();
    let mut root = canonical.clone();
    for ancestor in canonical.ancestors().skip(1) {
        if ancestor.metadata()?.dev() != dev {
            break;
        }
        root = ancestor.to_path_buf();
    }
    Ok(root)
}

impl Volume for LinuxVolume {
    type Source = SourceFile;
    type Reader = File;
    type Device = File;

    fn describe(&self, path: &Path) -> Result<VolumeInfo> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let stat = fstatfs(&file).map_err(|e| Error::io(path, e))?;

        let magic = stat.f_type as u64 & 0xffff_ffff;
        if magic != NTFS_SB_MAGIC && magic != NTFS3_SUPER_MAGIC {
            return Err(Error::unsupported(
                path,
                format!("file system magic {:#x} is not NTFS", magic),
            ));
        }

        let device_path = path.resolve_device().map_err(|e| Error::io(path, e))?;
        let sector_size = logical_sector_size(&device_path)?;
        let root = mount_root(path).map_err(|e| Error::io(path, e))?;

        Ok(VolumeInfo {
            root,
            device_path,
            cluster_size: stat.f_bsize as u64,
            sector_size,
        })
    }

    fn open_source(&self, path: &Path) -> Result<SourceFile> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(SourceFile {
            file,
            path: path.to_path_buf(),
        })
    }

    fn source_len(&self, source: &SourceFile) -> Result<u64> {
        let metadata = source
            .file
            .metadata()
            .map_err(|e| Error::io(&source.path, e))?;
        Ok(metadata.len())
    }

    fn resolve_extents(&self, source: &SourceFile, info: &VolumeInfo) -> Result<ExtentTable> {
        let len = self.source_len(source)?;
        if len == 0 {
            return Ok(ExtentTable::empty(info.cluster_size));
        }

        // Delayed allocations have no physical location until written back.
        if let Err(e) = source.file.sync_data() {
            warn!(
                path = %source.path.display(),
                "sync before FIEMAP failed, extent map may be stale: {}",
                e
            );
        }

        let extents = source.file.fiemap_range(0, len).map_err(|e| {
            match e.raw_os_error() {
                Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY) => {
                    Error::unsupported(&source.path, format!("FIEMAP is not supported: {}", e))
                }
                _ => Error::extent_query(format!("FIEMAP failed for {}", source.path.display()), e),
            }
        })?;
        debug!(path = %source.path.display(), extents = extents.len(), "FIEMAP");

        table_from_fiemap(&extents, info.cluster_size, len)
    }

    fn open_reader(&self, path: &Path) -> Result<File> {
        File::open(path).map_err(|e| Error::io(path, e))
    }

    fn open_device(&self, path: &Path) -> Result<File> {
        open_unbuffered(path)
    }
}

impl SnapshotProvider for LinuxVolume {
    fn create_snapshot(&self, volume_root: &Path) -> Result<Snapshot> {
        Err(Error::SnapshotCreationFailed {
            volume: volume_root.to_path_buf(),
            code: None,
            message: "volume snapshots are not available on Linux; disable snapshots to read \
                      the live device"
                .to_string(),
        })
    }

    fn release_snapshot(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
}

/// Convert byte-granular FIEMAP extents into a cluster table.
///
/// Gaps and unwritten extents become holes, and the table is padded with a
/// trailing hole up to the cluster-rounded file length. A file whose only
/// extent is not cluster aligned keeps its data inline in the MFT record and
/// gets an empty table.
pub(crate) fn table_from_fiemap(
    extents: &[FiemapExtent],
    cluster_size: u64,
    file_len: u64,
) -> Result<ExtentTable> {
    let aligned = |e: &FiemapExtent| {
        e.logical % cluster_size == 0
            && e.physical % cluster_size == 0
            && e.length % cluster_size == 0
    };
    if !extents.iter().all(aligned) {
        if file_len <= cluster_size {
            return Ok(ExtentTable::empty(cluster_size));
        }
        return Err(Error::malformed(format!(
            "FIEMAP returned extents that are not aligned to the {} byte cluster size",
            cluster_size
        )));
    }

    let mut sorted: Vec<&FiemapExtent> = extents.iter().collect();
    sorted.sort_by_key(|e| e.logical);

    let mut table = Vec::with_capacity(sorted.len() + 1);
    let mut vcn = 0u64;
    for extent in sorted {
        if extent.flags.is_delalloc() || extent.flags.is_unknown() {
            return Err(Error::malformed(format!(
                "extent at byte {} has no physical location yet",
                extent.logical
            )));
        }

        let start = extent.logical / cluster_size;
        let count = extent.length / cluster_size;
        if count == 0 {
            continue;
        }
        if start < vcn {
            return Err(Error::malformed(format!(
                "extent at byte {} overlaps the previous extent",
                extent.logical
            )));
        }
        if start > vcn {
            table.push(Extent::hole(vcn, start - vcn));
        }

        let lcn = if extent.flags.is_unwritten() {
            None
        } else {
            Some(extent.physical / cluster_size)
        };
        table.push(Extent {
            starting_vcn: start,
            lcn,
            cluster_count: count,
        });
        vcn = start + count;
    }

    let allocated = file_len.div_ceil(cluster_size);
    if vcn < allocated {
        table.push(Extent::hole(vcn, allocated - vcn));
    }

    ExtentTable::new(cluster_size, table)
}
