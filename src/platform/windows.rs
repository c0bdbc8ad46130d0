//! Windows backend.
//!
//! Extents come from `FSCTL_GET_RETRIEVAL_POINTERS`, geometry from
//! `GetDiskFreeSpaceW`, and the raw device is the volume GUID path
//! (`\\?\Volume{...}`) or the shadow copy device object. Source files are
//! opened with `FILE_READ_ATTRIBUTES` only, which is enough to query their
//! extents even while another process holds them open without sharing.

use crate::device::open_unbuffered;
use crate::error::{Error, Result};
use crate::extent::{self, ExtentTable, QueryStatus, RetrievalPointerQuery};
use crate::platform::{Volume, VolumeInfo};
use crate::snapshot::{ShadowCopyProvider, Snapshot, SnapshotProvider};

use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::os::windows::fs::{MetadataExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use std::ptr;

use winapi::shared::minwindef::{DWORD, LPVOID, MAX_PATH};
use winapi::shared::winerror::{
    ERROR_HANDLE_EOF, ERROR_INVALID_FUNCTION, ERROR_MORE_DATA, ERROR_NOT_SUPPORTED,
};
use winapi::um::fileapi::{
    GetDiskFreeSpaceW, GetVolumeInformationW, GetVolumeNameForVolumeMountPointW,
    GetVolumePathNameW,
};
use winapi::um::ioapiset::DeviceIoControl;
use winapi::um::winbase::FILE_FLAG_BACKUP_SEMANTICS;
use winapi::um::winioctl::FSCTL_GET_RETRIEVAL_POINTERS;
use winapi::um::winnt::{
    FILE_ATTRIBUTE_COMPRESSED, FILE_ATTRIBUTE_ENCRYPTED, FILE_READ_ATTRIBUTES, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, HANDLE, SYNCHRONIZE,
};

const SHARE_ALL: DWORD = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;

/// Longest path accepted by the wide-character volume APIs.
const PATH_BUFFER_LEN: usize = 32 * 1024;

/// NTFS volumes on the local machine.
#[derive(Debug, Clone, Default)]
pub struct WindowsVolume {
    shadow: ShadowCopyProvider,
}

impl WindowsVolume {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific shadow copy provider.
    pub fn with_shadow_provider(mut self, shadow: ShadowCopyProvider) -> Self {
        self.shadow = shadow;
        self
    }
}

/// A source file opened for extent queries.
#[derive(Debug)]
pub struct SourceFile {
    file: File,
    path: PathBuf,
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> OsString {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    OsString::from_wide(&buf[..len])
}

fn last_error(path: &Path) -> Error {
    Error::io(path, io::Error::last_os_error())
}

impl Volume for WindowsVolume {
    type Source = SourceFile;
    type Reader = File;
    type Device = File;

    fn describe(&self, path: &Path) -> Result<VolumeInfo> {
        let wide_path = wide(path.as_os_str());
        let mut root = vec![0u16; PATH_BUFFER_LEN];
        // SAFETY: both buffers are valid for the lengths passed.
        let ok = unsafe {
            GetVolumePathNameW(wide_path.as_ptr(), root.as_mut_ptr(), root.len() as DWORD)
        };
        if ok == 0 {
            return Err(last_error(path));
        }
        let root_path = PathBuf::from(from_wide(&root));
        let root = wide(root_path.as_os_str());

        let mut fs_name = [0u16; MAX_PATH + 1];
        // SAFETY: optional outputs are null, fs_name is valid for its length.
        let ok = unsafe {
            GetVolumeInformationW(
                root.as_ptr(),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                fs_name.as_mut_ptr(),
                fs_name.len() as DWORD,
            )
        };
        if ok == 0 {
            return Err(last_error(&root_path));
        }
        let fs_name = from_wide(&fs_name).to_string_lossy().into_owned();
        if !fs_name.eq_ignore_ascii_case("NTFS") {
            return Err(Error::unsupported(
                &root_path,
                format!("volume is formatted {}, not NTFS", fs_name),
            ));
        }

        let mut sectors_per_cluster: DWORD = 0;
        let mut bytes_per_sector: DWORD = 0;
        let mut free_clusters: DWORD = 0;
        let mut total_clusters: DWORD = 0;
        // SAFETY: all out-pointers reference live locals.
        let ok = unsafe {
            GetDiskFreeSpaceW(
                root.as_ptr(),
                &mut sectors_per_cluster,
                &mut bytes_per_sector,
                &mut free_clusters,
                &mut total_clusters,
            )
        };
        if ok == 0 {
            return Err(last_error(&root_path));
        }

        let mut volume_name = [0u16; MAX_PATH + 1];
        // SAFETY: root is NUL-terminated with a trailing separator and
        // volume_name is valid for its length.
        let ok = unsafe {
            GetVolumeNameForVolumeMountPointW(
                root.as_ptr(),
                volume_name.as_mut_ptr(),
                volume_name.len() as DWORD,
            )
        };
        if ok == 0 {
            return Err(last_error(&root_path));
        }
        // The device itself is the volume name without its trailing separator.
        let volume_name = from_wide(&volume_name).to_string_lossy().into_owned();
        let device_path = PathBuf::from(volume_name.trim_end_matches('\\'));

        Ok(VolumeInfo {
            root: root_path,
            device_path,
            cluster_size: sectors_per_cluster as u64 * bytes_per_sector as u64,
            sector_size: bytes_per_sector as u64,
        })
    }

    fn open_source(&self, path: &Path) -> Result<SourceFile> {
        let file = OpenOptions::new()
            .access_mode(FILE_READ_ATTRIBUTES | SYNCHRONIZE)
            .share_mode(SHARE_ALL)
            .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
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
        let metadata = source
            .file
            .metadata()
            .map_err(|e| Error::io(&source.path, e))?;
        let attributes = metadata.file_attributes();
        if attributes & FILE_ATTRIBUTE_COMPRESSED != 0 {
            return Err(Error::unsupported(
                &source.path,
                "file is NTFS-compressed; its clusters do not hold plain data",
            ));
        }
        if attributes & FILE_ATTRIBUTE_ENCRYPTED != 0 {
            return Err(Error::unsupported(
                &source.path,
                "file is EFS-encrypted; its clusters do not hold plain data",
            ));
        }

        let mut query = RetrievalPointerHandle {
            file: &source.file,
            path: &source.path,
        };
        extent::resolve_extents(&mut query, info.cluster_size)
    }

    fn open_reader(&self, path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .share_mode(SHARE_ALL)
            .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
            .open(path)
            .map_err(|e| Error::io(path, e))
    }

    fn open_device(&self, path: &Path) -> Result<File> {
        open_unbuffered(path)
    }

    /// Drive letters compare case-insensitively, so the live path is matched
    /// against the volume root as text.
    fn snapshot_path(&self, snapshot: &Snapshot, path: &Path) -> Result<PathBuf> {
        let full = path.to_string_lossy();
        let root = snapshot.volume_root.to_string_lossy();
        let matches_root = full.len() >= root.len()
            && full.is_char_boundary(root.len())
            && full[..root.len()].eq_ignore_ascii_case(&root);
        if !matches_root {
            return snapshot.translate(path);
        }

        let relative = full[root.len()..].trim_start_matches('\\');
        let device = snapshot.device_object.to_string_lossy();
        Ok(PathBuf::from(format!(
            "{}\\{}",
            device.trim_end_matches('\\'),
            relative
        )))
    }
}

impl SnapshotProvider for WindowsVolume {
    fn create_snapshot(&self, volume_root: &Path) -> Result<Snapshot> {
        self.shadow.create_snapshot(volume_root)
    }

    fn release_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.shadow.release_snapshot(snapshot)
    }
}

/// Issues `FSCTL_GET_RETRIEVAL_POINTERS` against an open file.
struct RetrievalPointerHandle<'a> {
    file: &'a File,
    path: &'a Path,
}

impl RetrievalPointerQuery for RetrievalPointerHandle<'_> {
    fn query(&mut self, starting_vcn: u64, buf: &mut [u8]) -> Result<QueryStatus> {
        let mut input = i64::try_from(starting_vcn)
            .map_err(|_| Error::malformed(format!("VCN {} out of range", starting_vcn)))?;
        let mut returned: DWORD = 0;

        // SAFETY: the input is a STARTING_VCN_INPUT_BUFFER (a single i64),
        // buf is valid for buf.len() bytes and 8-byte aligned by the caller.
        let ok = unsafe {
            DeviceIoControl(
                self.file.as_raw_handle() as HANDLE,
                FSCTL_GET_RETRIEVAL_POINTERS,
                &mut input as *mut i64 as LPVOID,
                std::mem::size_of::<i64>() as DWORD,
                buf.as_mut_ptr() as LPVOID,
                buf.len() as DWORD,
                &mut returned,
                ptr::null_mut(),
            )
        };
        if ok != 0 {
            return Ok(QueryStatus::Complete(returned as usize));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error().map(|code| code as DWORD) {
            // The buffer is full; its header counts the runs that fit.
            Some(ERROR_MORE_DATA) => Ok(QueryStatus::MoreData(buf.len())),
            Some(ERROR_HANDLE_EOF) => Ok(QueryStatus::EndOfFile),
            Some(ERROR_INVALID_FUNCTION) | Some(ERROR_NOT_SUPPORTED) => Err(Error::unsupported(
                self.path,
                format!("volume does not support retrieval pointers: {}", err),
            )),
            _ => Err(Error::extent_query(
                format!(
                    "FSCTL_GET_RETRIEVAL_POINTERS failed for {}",
                    self.path.display()
                ),
                err,
            )),
        }
    }
}
