//! Copy orchestration.
//!
//! A copy walks a fixed sequence of phases: optionally snapshot the volume,
//! resolve the source's extent table, then stream every extent from the raw
//! device into the destination at the same file offset. Holes are written as
//! zeros. Whatever happens, the source handle, the device handle and the
//! snapshot are released in that order before [`copy`] returns.

use crate::cancel::CancelToken;
use crate::device::{AlignedBuffer, BlockDevice, RawVolume};
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentTable};
use crate::options::Options;
use crate::platform::{Volume, VolumeInfo};
use crate::progress::{Progress, Transfer};
use crate::snapshot::SnapshotGuard;
use crate::state::{CopyResult, Phase};

use rayon::prelude::*;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Trait for copying a file through its raw extents.
///
/// # Example
///
/// ```no_run
/// use rawcopy::{Options, RawCopy};
/// use std::path::Path;
///
/// let source = Path::new(r"C:\Windows\System32\config\SAM");
///
/// // Snapshot the volume and copy with default options
/// let result = source.raw_copy(Path::new("SAM.bak")).unwrap();
/// println!("{} bytes in {} extents", result.bytes_copied, result.extent_count);
///
/// // Copy the live volume, replacing an existing destination
/// let opts = Options::new().with_snapshot(false).with_overwrite(true);
/// source.raw_copy_opt(Path::new("SAM.bak"), &opts).unwrap();
/// ```
#[cfg(any(windows, target_os = "linux"))]
pub trait RawCopy {
    /// Copy to `destination` with default options.
    fn raw_copy(&self, destination: &Path) -> Result<CopyResult> {
        self.raw_copy_opt(destination, &Options::default())
    }

    /// Copy to `destination` with `options`.
    fn raw_copy_opt(&self, destination: &Path, options: &Options) -> Result<CopyResult>;
}

#[cfg(any(windows, target_os = "linux"))]
impl RawCopy for Path {
    fn raw_copy_opt(&self, destination: &Path, options: &Options) -> Result<CopyResult> {
        CopyJob::new(self, destination, options.clone()).run()
    }
}

#[cfg(any(windows, target_os = "linux"))]
impl RawCopy for PathBuf {
    fn raw_copy_opt(&self, destination: &Path, options: &Options) -> Result<CopyResult> {
        self.as_path().raw_copy_opt(destination, options)
    }
}

/// A source, a destination and the options to copy with.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub options: Options,
}

impl CopyJob {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: Options,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options,
        }
    }

    /// Run on the native backend without progress or cancellation.
    #[cfg(any(windows, target_os = "linux"))]
    pub fn run(&self) -> Result<CopyResult> {
        let volume = crate::platform::NativeVolume::default();
        copy(
            &volume,
            self,
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
    }
}

/// Handles owned by one copy. Fields drop in declaration order, which is
/// the release order: source, device, then the snapshot.
struct Session<'v, V: Volume> {
    source: Option<V::Source>,
    device: Option<RawVolume<V::Device>>,
    snapshot: Option<SnapshotGuard<'v, V>>,
}

fn enter(progress: &dyn Progress, phase: Phase) {
    info!(%phase, "phase");
    progress.on_phase(phase);
}

/// Copy `job.source` to `job.destination` through `volume`.
///
/// Emits every phase to `progress`, ending with
/// [`Phase::SnapshotReleased`] once all handles are closed, on success and
/// on failure alike. On failure a partially written destination is left in
/// place.
pub fn copy<V: Volume>(
    volume: &V,
    job: &CopyJob,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<CopyResult> {
    let started = Instant::now();
    enter(progress, Phase::Idle);

    let mut session = Session {
        source: None,
        device: None,
        snapshot: None,
    };
    let context = CopyContext {
        volume,
        job,
        progress,
        cancel,
    };
    let outcome = context.run(&mut session);

    match &outcome {
        Ok(_) => enter(progress, Phase::Completed),
        Err(Error::Cancelled) => enter(progress, Phase::Cancelled),
        Err(e) => {
            error!(source = %job.source.display(), "copy failed: {}", e);
            enter(progress, Phase::Failed);
        }
    }
    drop(session);
    enter(progress, Phase::SnapshotReleased);

    outcome.map(|mut result| {
        result.elapsed = started.elapsed();
        result
    })
}

struct CopyContext<'a, V: Volume> {
    volume: &'a V,
    job: &'a CopyJob,
    progress: &'a dyn Progress,
    cancel: &'a CancelToken,
}

impl<'a, V: Volume> CopyContext<'a, V> {
    fn run(&self, session: &mut Session<'a, V>) -> Result<CopyResult> {
        let job = self.job;
        let options = &job.options;
        options.validate()?;

        if job.destination.exists() && !options.overwrite {
            return Err(Error::DestinationExists(job.destination.clone()));
        }

        let info = self.volume.describe(&job.source)?;
        debug!(
            root = %info.root.display(),
            device = %info.device_path.display(),
            cluster_size = info.cluster_size,
            sector_size = info.sector_size,
            "volume"
        );

        let (effective_source, device_path) = if options.use_snapshot {
            enter(self.progress, Phase::SnapshotCreating);
            let guard = SnapshotGuard::acquire(self.volume, &info.root)?;
            let snapshot = match guard.snapshot() {
                Some(snapshot) => snapshot.clone(),
                None => return Err(Error::malformed("snapshot released before use")),
            };
            session.snapshot = Some(guard);
            let path = self.volume.snapshot_path(&snapshot, &job.source)?;
            (path, snapshot.device_object)
        } else {
            (job.source.clone(), info.device_path.clone())
        };

        enter(self.progress, Phase::ExtentsResolving);
        let source = session
            .source
            .insert(self.volume.open_source(&effective_source)?);
        let file_len = self.volume.source_len(source)?;
        let table = self.volume.resolve_extents(source, &info)?;
        info!(
            source = %effective_source.display(),
            file_len,
            extents = table.len(),
            holes = table.hole_count(),
            "extents resolved"
        );

        if table.is_empty() && file_len > 0 {
            if !options.allow_fallback {
                return Err(Error::unsupported(
                    &effective_source,
                    "file data is resident in its MFT record and has no extents; \
                     allow fallback to copy it with a regular read",
                ));
            }
            return self.copy_resident(effective_source, file_len, session.snapshot.is_some());
        }

        if table.allocated_bytes() < file_len {
            return Err(Error::malformed(format!(
                "extents map {} bytes but the file is {} bytes long",
                table.allocated_bytes(),
                file_len
            )));
        }
        if info.sector_size == 0 || table.cluster_size() % info.sector_size != 0 {
            return Err(Error::unsupported(
                &effective_source,
                format!(
                    "cluster size {} is not a multiple of the {} byte sector size",
                    table.cluster_size(),
                    info.sector_size
                ),
            ));
        }

        let device = if options.dry_run {
            None
        } else {
            let handle = self.volume.open_device(&device_path)?;
            let device = RawVolume::new(&device_path, handle, info.sector_size)
                .with_read_timeout(options.read_timeout);
            Some(&*session.device.insert(device))
        };
        let destination = if options.dry_run {
            None
        } else {
            Some(self.open_destination()?)
        };

        enter(self.progress, Phase::Copying);
        let transfer = Transfer::start(table.allocated_bytes(), self.progress);
        match (device, &destination) {
            (Some(device), Some(file)) => {
                let sink = Sink {
                    file,
                    path: &job.destination,
                };
                self.copy_extents(&table, &info, device, &sink, &transfer)?;
                file.set_len(file_len)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| Error::write(&job.destination, e))?;
            }
            _ => {
                for extent in &table {
                    self.cancel.check()?;
                    transfer.advance(extent.byte_len(table.cluster_size()));
                }
            }
        }
        debug_assert_eq!(transfer.copied(), transfer.total());

        Ok(CopyResult {
            effective_source,
            device_path,
            bytes_copied: transfer.copied(),
            total_bytes: transfer.total(),
            file_len,
            extent_count: table.len(),
            hole_count: table.hole_count(),
            used_snapshot: session.snapshot.is_some(),
            used_fallback: false,
            elapsed: Duration::ZERO,
        })
    }

    fn open_destination(&self) -> Result<File> {
        let path = &self.job.destination;
        let mut open = OpenOptions::new();
        open.write(true);
        if self.job.options.overwrite {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }
        open.open(path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::DestinationExists(path.clone()),
            _ => Error::write(path, e),
        })
    }

    fn copy_extents<D: BlockDevice>(
        &self,
        table: &ExtentTable,
        info: &VolumeInfo,
        device: &RawVolume<D>,
        sink: &Sink<'_>,
        transfer: &Transfer<'_>,
    ) -> Result<()> {
        let alignment = info.buffer_alignment() as usize;
        let chunk = (self.job.options.buffer_size / alignment).max(1) * alignment;
        let cluster_size = table.cluster_size();
        let threads = self.job.options.threads;

        if threads <= 1 || table.len() <= 1 {
            let mut buf = AlignedBuffer::new(chunk, alignment);
            for extent in table {
                copy_extent(extent, cluster_size, device, sink, &mut buf, transfer, self.cancel)?;
            }
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot start copy threads: {}", e)))?;
        let cancel = self.cancel;
        pool.install(|| {
            table.extents().par_iter().try_for_each_init(
                || AlignedBuffer::new(chunk, alignment),
                |buf, extent| copy_extent(extent, cluster_size, device, sink, buf, transfer, cancel),
            )
        })
    }

    /// Copy a file with no extents through the regular file API.
    fn copy_resident(
        &self,
        effective_source: PathBuf,
        file_len: u64,
        used_snapshot: bool,
    ) -> Result<CopyResult> {
        let options = &self.job.options;
        info!(source = %effective_source.display(), file_len, "copying resident file");

        let mut reader = self.volume.open_reader(&effective_source)?;
        let mut destination = if options.dry_run {
            None
        } else {
            Some(self.open_destination()?)
        };

        enter(self.progress, Phase::Copying);
        let transfer = Transfer::start(file_len, self.progress);
        match destination.as_mut() {
            Some(file) => {
                let mut buf = vec![0u8; options.buffer_size];
                let mut copied = 0u64;
                loop {
                    self.cancel.check()?;
                    let n = match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(source) => {
                            return Err(Error::ReadFailed {
                                offset: copied,
                                source,
                            })
                        }
                    };
                    file.write_all(&buf[..n])
                        .map_err(|e| Error::write(&self.job.destination, e))?;
                    copied += n as u64;
                    transfer.advance(n as u64);
                }
                if copied != file_len {
                    return Err(Error::ReadFailed {
                        offset: copied,
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("read {} of {} bytes", copied, file_len),
                        ),
                    });
                }
                file.sync_all()
                    .map_err(|e| Error::write(&self.job.destination, e))?;
            }
            None => transfer.advance(file_len),
        }

        Ok(CopyResult {
            effective_source,
            device_path: PathBuf::new(),
            bytes_copied: transfer.copied(),
            total_bytes: transfer.total(),
            file_len,
            extent_count: 0,
            hole_count: 0,
            used_snapshot,
            used_fallback: true,
            elapsed: Duration::ZERO,
        })
    }
}

/// The destination file and the path used in its errors.
struct Sink<'a> {
    file: &'a File,
    path: &'a Path,
}

impl Sink<'_> {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        write_all_at(self.file, buf, offset).map_err(|e| Error::write(self.path, e))
    }
}

/// Stream one extent into the destination at its file offset.
fn copy_extent<D: BlockDevice>(
    extent: &Extent,
    cluster_size: u64,
    device: &RawVolume<D>,
    sink: &Sink<'_>,
    buf: &mut [u8],
    transfer: &Transfer<'_>,
    cancel: &CancelToken,
) -> Result<()> {
    let len = extent.byte_len(cluster_size);
    let file_offset = extent.file_offset(cluster_size);
    let volume_offset = extent.volume_offset(cluster_size);
    debug!(
        vcn = extent.starting_vcn,
        lcn = ?extent.lcn,
        clusters = extent.cluster_count,
        "copying extent"
    );

    if volume_offset.is_none() {
        buf.fill(0);
    }

    let mut done = 0u64;
    while done < len {
        cancel.check()?;
        let n = (len - done).min(buf.len() as u64) as usize;
        let chunk = &mut buf[..n];
        if let Some(base) = volume_offset {
            device.read_at(base + done, chunk)?;
        }
        sink.write_all_at(chunk, file_offset + done)?;
        done += n as u64;
        transfer.advance(n as u64);
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::progress::NoProgress;
    use crate::testing::{pattern, MemoryVolume, RecordingProgress, Run};
    use std::fs;

    const CLUSTER: u64 = 4096;

    /// Source handle first, then the device, then the snapshot.
    const RELEASE_ORDER: [&str; 3] = ["source", "device", "snapshot"];

    fn job(volume: &MemoryVolume, name: &str, destination: &Path, options: Options) -> CopyJob {
        CopyJob::new(volume.path(name), destination, options)
    }

    fn assert_clean(volume: &MemoryVolume) {
        assert_eq!(volume.open_handles(), 0);
        assert_eq!(volume.snapshots_created(), volume.snapshots_released());
    }

    #[test]
    fn test_copy_contiguous_through_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let data = pattern(5000, 1);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 32);
        volume.add_file("a.bin", &data, &[Run::Data(5, 2)]);

        let progress = RecordingProgress::new();
        let result = copy(
            &volume,
            &job(&volume, "a.bin", &dest, Options::default()),
            &progress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
        assert_eq!(result.file_len, 5000);
        assert_eq!(result.total_bytes, 2 * CLUSTER);
        assert_eq!(result.bytes_copied, result.total_bytes);
        assert_eq!(result.extent_count, 1);
        assert!(result.used_snapshot);
        assert!(!result.used_fallback);
        assert_eq!(result.effective_source, PathBuf::from("/snapshots/1/a.bin"));
        assert_eq!(volume.opened_devices(), vec![PathBuf::from("/snapshots/1")]);
        assert_eq!(volume.snapshots_created(), 1);
        assert_clean(&volume);
        assert_eq!(volume.releases(), RELEASE_ORDER);
        assert_eq!(
            progress.phases(),
            vec![
                Phase::Idle,
                Phase::SnapshotCreating,
                Phase::ExtentsResolving,
                Phase::Copying,
                Phase::Completed,
                Phase::SnapshotReleased,
            ]
        );
    }

    #[test]
    fn test_copy_fragmented_matches_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(10 * CLUSTER as usize - 123, 7);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 64);
        volume.add_file(
            "frag.bin",
            &data,
            &[Run::Data(40, 3), Run::Data(10, 2), Run::Data(25, 5)],
        );
        volume.add_file("flat.bin", &data, &[Run::Data(50, 10)]);

        let options = Options::default().with_buffer_size_kb(8);
        let frag = dir.path().join("frag.out");
        let flat = dir.path().join("flat.out");
        let result = copy(
            &volume,
            &job(&volume, "frag.bin", &frag, options.clone()),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
        copy(
            &volume,
            &job(&volume, "flat.bin", &flat, options),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(result.extent_count, 3);
        assert_eq!(fs::read(&frag).unwrap(), data);
        assert_eq!(fs::read(&frag).unwrap(), fs::read(&flat).unwrap());
        assert_clean(&volume);
    }

    #[test]
    fn test_copy_zero_fills_holes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sparse.out");
        let mut data = pattern(6 * CLUSTER as usize, 3);
        data[2 * CLUSTER as usize..5 * CLUSTER as usize].fill(0);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16);
        volume.add_file(
            "sparse.bin",
            &data,
            &[Run::Data(3, 2), Run::Hole(3), Run::Data(9, 1)],
        );

        let options = Options::default().with_snapshot(false);
        let result = copy(
            &volume,
            &job(&volume, "sparse.bin", &dest, options),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
        assert_eq!(result.hole_count, 1);
        assert_eq!(result.bytes_copied, 6 * CLUSTER);
        // Two data extents, each fits one buffer.
        assert_eq!(volume.device_reads(), 2);
        assert_clean(&volume);
    }

    #[test]
    fn test_progress_is_monotonic_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let data = pattern(12 * CLUSTER as usize, 9);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 32);
        volume.add_file("a.bin", &data, &[Run::Data(1, 5), Run::Hole(2), Run::Data(20, 5)]);

        let progress = RecordingProgress::new();
        let options = Options::default().with_buffer_size_kb(4);
        let result = copy(
            &volume,
            &job(&volume, "a.bin", &dest, options),
            &progress,
            &CancelToken::new(),
        )
        .unwrap();

        let copied = progress.copied();
        assert_eq!(copied.len(), 12);
        assert!(copied.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(copied.last().copied(), Some(result.total_bytes));
        assert_eq!(*progress.started_with.lock().unwrap(), Some(result.total_bytes));
    }

    #[test]
    fn test_existing_destination_is_rejected_before_anything() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("exists.bin");
        fs::write(&dest, b"keep me").unwrap();
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16);
        volume.add_file("a.bin", &pattern(4096, 1), &[Run::Data(2, 1)]);

        let progress = RecordingProgress::new();
        let err = copy(
            &volume,
            &job(&volume, "a.bin", &dest, Options::default()),
            &progress,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DestinationExists);
        assert_eq!(fs::read(&dest).unwrap(), b"keep me");
        assert_eq!(volume.snapshots_created(), 0);
        assert_eq!(volume.device_reads(), 0);
        assert_clean(&volume);
        assert_eq!(
            progress.phases(),
            vec![Phase::Idle, Phase::Failed, Phase::SnapshotReleased]
        );
    }

    #[test]
    fn test_overwrite_truncates_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("exists.bin");
        fs::write(&dest, vec![0xAAu8; 5 * CLUSTER as usize]).unwrap();
        let data = pattern(1000, 4);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16);
        volume.add_file("a.bin", &data, &[Run::Data(2, 1)]);

        let options = Options::default().with_overwrite(true);
        copy(
            &volume,
            &job(&volume, "a.bin", &dest, options),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_cancel_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let data = pattern(8 * CLUSTER as usize, 5);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 32);
        volume.add_file("a.bin", &data, &[Run::Data(4, 8)]);

        let cancel = CancelToken::new();
        let progress = RecordingProgress::cancelling(2, cancel.clone());
        let options = Options::default().with_buffer_size_kb(4);
        let err = copy(
            &volume,
            &job(&volume, "a.bin", &dest, options),
            &progress,
            &cancel,
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(progress.copied(), vec![CLUSTER, 2 * CLUSTER]);
        assert_eq!(volume.snapshots_created(), 1);
        assert_clean(&volume);
        assert_eq!(volume.releases(), RELEASE_ORDER);
        let phases = progress.phases();
        assert_eq!(
            &phases[phases.len() - 2..],
            &[Phase::Cancelled, Phase::SnapshotReleased]
        );
        // The partial destination stays behind.
        assert!(dest.exists());
    }

    #[test]
    fn test_live_volume_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let data = pattern(3000, 2);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16);
        volume.add_file("a.bin", &data, &[Run::Data(7, 1)]);

        let progress = RecordingProgress::new();
        let options = Options::default().with_snapshot(false);
        let result = copy(
            &volume,
            &job(&volume, "a.bin", &dest, options),
            &progress,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(!result.used_snapshot);
        assert_eq!(result.effective_source, volume.path("a.bin"));
        assert_eq!(volume.opened_devices(), vec![PathBuf::from("/dev/memvol")]);
        assert_eq!(volume.snapshots_created(), 0);
        assert!(!progress.phases().contains(&Phase::SnapshotCreating));
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_snapshot_failure_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16).with_failing_snapshots();
        volume.add_file("a.bin", &pattern(4096, 1), &[Run::Data(2, 1)]);

        let progress = RecordingProgress::new();
        let err = copy(
            &volume,
            &job(&volume, "a.bin", &dest, Options::default()),
            &progress,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SnapshotCreationFailed);
        assert!(!dest.exists());
        assert_eq!(volume.device_reads(), 0);
        assert_clean(&volume);
        assert_eq!(
            progress.phases(),
            vec![
                Phase::Idle,
                Phase::SnapshotCreating,
                Phase::Failed,
                Phase::SnapshotReleased,
            ]
        );
    }

    #[test]
    fn test_resident_file_requires_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("small.out");
        let data = b"resident data".to_vec();
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16);
        volume.add_resident("small.txt", &data);

        let err = copy(
            &volume,
            &job(&volume, "small.txt", &dest, Options::default()),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileSystem);
        assert!(!dest.exists());
        assert_clean(&volume);

        let options = Options::default().with_allow_fallback(true);
        let result = copy(
            &volume,
            &job(&volume, "small.txt", &dest, options),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(result.used_fallback);
        assert_eq!(result.bytes_copied, data.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), data);
        assert_eq!(volume.device_reads(), 0);
        assert_clean(&volume);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty.out");
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16);
        volume.add_resident("empty.bin", &[]);

        let result = copy(
            &volume,
            &job(&volume, "empty.bin", &dest, Options::default()),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(result.bytes_copied, 0);
        assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
        assert_clean(&volume);
    }

    #[test]
    fn test_parallel_copy() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("par.out");
        let data = pattern(16 * CLUSTER as usize - 1, 11);
        let runs: Vec<Run> = (0..8).map(|i| Run::Data(60 - i * 7, 2)).collect();
        let mut volume = MemoryVolume::new(CLUSTER, 512, 64);
        volume.add_file("a.bin", &data, &runs);

        let progress = RecordingProgress::new();
        let options = Options::default().with_threads(4).with_buffer_size_kb(4);
        let result = copy(
            &volume,
            &job(&volume, "a.bin", &dest, options),
            &progress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
        assert_eq!(result.bytes_copied, 16 * CLUSTER);
        let copied = progress.copied();
        assert_eq!(copied.len(), 16);
        assert!(copied.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(copied.last().copied(), Some(16 * CLUSTER));
        assert_clean(&volume);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dry.out");
        let mut volume = MemoryVolume::new(CLUSTER, 512, 16);
        volume.add_file("a.bin", &pattern(9000, 1), &[Run::Data(2, 1), Run::Data(8, 2)]);

        let options = Options::default().with_dry_run(true);
        let result = copy(
            &volume,
            &job(&volume, "a.bin", &dest, options),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(result.bytes_copied, 3 * CLUSTER);
        assert!(!dest.exists());
        assert_eq!(volume.device_reads(), 0);
        assert!(volume.opened_devices().is_empty());
        assert_clean(&volume);
    }

    #[test]
    fn test_read_failure_leaves_partial_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let data = pattern(2 * CLUSTER as usize, 6);
        let mut volume = MemoryVolume::new(CLUSTER, 512, 8);
        let table = ExtentTable::new(
            CLUSTER,
            vec![Extent::mapped(0, 1, 1), Extent::mapped(1, 100, 1)],
        )
        .unwrap();
        volume.add_table("bad.bin", &data, table);

        let progress = RecordingProgress::new();
        let err = copy(
            &volume,
            &job(&volume, "bad.bin", &dest, Options::default()),
            &progress,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ReadFailed);
        assert!(dest.exists());
        assert_clean(&volume);
        assert_eq!(volume.releases(), RELEASE_ORDER);
        assert!(progress.phases().contains(&Phase::Failed));
    }

    #[test]
    fn test_short_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let mut volume = MemoryVolume::new(CLUSTER, 512, 8);
        volume.add_file("a.bin", &pattern(3 * CLUSTER as usize, 1), &[Run::Data(1, 1)]);

        let err = copy(
            &volume,
            &job(&volume, "a.bin", &dest, Options::default()),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtentQueryFailed);
        assert_clean(&volume);
    }

    #[test]
    fn test_invalid_options() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let mut volume = MemoryVolume::new(CLUSTER, 512, 8);
        volume.add_file("a.bin", &pattern(100, 1), &[Run::Data(1, 1)]);

        let options = Options::default().with_threads(0);
        let err = copy(
            &volume,
            &job(&volume, "a.bin", &dest, options),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(!dest.exists());
    }
}
