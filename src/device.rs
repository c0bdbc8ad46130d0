//! Raw volume access.
//!
//! Volume devices are opened for unbuffered reads (`O_DIRECT` on Linux,
//! `FILE_FLAG_NO_BUFFERING` on Windows) with every sharing mode allowed, so
//! that the device can be read while the file system has it mounted.
//! Unbuffered I/O requires offsets, lengths and memory addresses that are
//! multiples of the sector size; [`RawVolume`] checks the first two and
//! [`AlignedBuffer`] provides the third.

use crate::error::{Error, Result};

use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// Positioned reads from a block device or device image.
pub trait BlockDevice: Send + Sync {
    /// Read into `buf` starting at the absolute byte `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl BlockDevice for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

/// Open a volume device for unbuffered, sequential, share-all reads.
pub fn open_unbuffered(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        use winapi::um::winbase::{FILE_FLAG_NO_BUFFERING, FILE_FLAG_SEQUENTIAL_SCAN};
        use winapi::um::winnt::{FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE};
        options
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE)
            .custom_flags(FILE_FLAG_NO_BUFFERING | FILE_FLAG_SEQUENTIAL_SCAN);
    }

    options.open(path).map_err(|source| Error::VolumeOpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// A volume device with sector-aligned, exact-length reads.
#[derive(Debug)]
pub struct RawVolume<D> {
    path: PathBuf,
    device: D,
    alignment: u64,
    read_timeout: Option<Duration>,
}

impl<D: BlockDevice> RawVolume<D> {
    /// Wrap an opened device. Every read must be aligned to `alignment`.
    pub fn new(path: impl Into<PathBuf>, device: D, alignment: u64) -> Self {
        Self {
            path: path.into(),
            device,
            alignment: alignment.max(1),
            read_timeout: None,
        }
    }

    /// Fail any single read that takes longer than `timeout`.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Required alignment of offsets and lengths.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Check that a request is aligned to the sector size.
    pub fn check_alignment(&self, offset: u64, length: u64) -> Result<()> {
        if offset % self.alignment != 0 || length % self.alignment != 0 {
            return Err(Error::AlignmentViolation {
                offset,
                length,
                alignment: self.alignment,
            });
        }
        Ok(())
    }

    /// Fill `buf` from the absolute byte `offset`.
    ///
    /// A read that returns zero bytes before `buf` is full is an unexpected
    /// end of device and fails the read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_alignment(offset, buf.len() as u64)?;

        let mut filled = 0usize;
        while filled < buf.len() {
            let at = offset + filled as u64;
            let started = Instant::now();
            let n = match self.device.read_at(&mut buf[filled..], at) {
                Ok(0) => {
                    return Err(Error::ReadFailed {
                        offset: at,
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "device {} ended {} bytes short of the extent",
                                self.path.display(),
                                buf.len() - filled
                            ),
                        ),
                    })
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(Error::ReadFailed { offset: at, source }),
            };

            if let Some(timeout) = self.read_timeout {
                let elapsed = started.elapsed();
                if elapsed > timeout {
                    return Err(Error::ReadFailed {
                        offset: at,
                        source: io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("read took {:?}, limit is {:?}", elapsed, timeout),
                        ),
                    });
                }
            }
            filled += n;
        }

        Ok(filled)
    }
}

/// Heap buffer whose start address is aligned for unbuffered I/O.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to `align` (a power of two).
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or `align` is not a power of two.
    pub fn new(len: usize, align: usize) -> Self {
        assert!(len > 0, "aligned buffer must not be empty");
        let layout = Layout::from_size_align(len, align).expect("invalid buffer alignment");
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }

    /// Alignment of the buffer's start address.
    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes and
        // uniquely borrowed through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}
