//! In-memory volume for exercising the copy engine without a real device.
//!
//! The volume is a byte image addressed in clusters. Files are registered
//! with an explicit run layout, their data is scattered into the image
//! accordingly, and every handle the engine opens is counted so tests can
//! check that nothing outlives a copy. Handle closes and snapshot releases
//! are also logged in the order they happen.

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentTable};
use crate::platform::{Volume, VolumeInfo};
use crate::progress::Progress;
use crate::snapshot::{Snapshot, SnapshotProvider};
use crate::state::{Phase, ProgressReport};
use crate::CancelToken;

use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const ROOT: &str = "/vol";
const DEVICE: &str = "/dev/memvol";
const SNAPSHOT_DIR: &str = "/snapshots";

/// Placement of one run of a registered file.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Run {
    /// `clusters` clusters stored at `lcn`.
    Data(u64, u64),
    /// `clusters` clusters with no storage.
    Hole(u64),
}

struct StoredFile {
    data: Vec<u8>,
    table: ExtentTable,
}

type ReleaseLog = Arc<Mutex<Vec<&'static str>>>;

/// Counts itself as an open handle until dropped, then logs its kind.
struct HandleToken {
    open: Arc<AtomicUsize>,
    releases: ReleaseLog,
    kind: &'static str,
}

impl HandleToken {
    fn new(volume: &MemoryVolume, kind: &'static str) -> Self {
        volume.handles.fetch_add(1, Ordering::SeqCst);
        Self {
            open: Arc::clone(&volume.handles),
            releases: Arc::clone(&volume.releases),
            kind,
        }
    }
}

impl Drop for HandleToken {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.releases.lock().unwrap().push(self.kind);
    }
}

pub(crate) struct MemorySource {
    name: PathBuf,
    _handle: HandleToken,
}

pub(crate) struct MemoryReader {
    cursor: Cursor<Vec<u8>>,
    _handle: HandleToken,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

pub(crate) struct MemoryDevice {
    image: Arc<Vec<u8>>,
    reads: Arc<AtomicUsize>,
    _handle: HandleToken,
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let start = (offset as usize).min(self.image.len());
        let n = buf.len().min(self.image.len() - start);
        buf[..n].copy_from_slice(&self.image[start..start + n]);
        Ok(n)
    }
}

pub(crate) struct MemoryVolume {
    info: VolumeInfo,
    image: Arc<Vec<u8>>,
    files: HashMap<PathBuf, StoredFile>,
    handles: Arc<AtomicUsize>,
    releases: ReleaseLog,
    reads: Arc<AtomicUsize>,
    created: AtomicUsize,
    released: AtomicUsize,
    fail_snapshots: bool,
    opened_devices: Mutex<Vec<PathBuf>>,
}

impl MemoryVolume {
    pub(crate) fn new(cluster_size: u64, sector_size: u64, clusters: u64) -> Self {
        Self {
            info: VolumeInfo {
                root: PathBuf::from(ROOT),
                device_path: PathBuf::from(DEVICE),
                cluster_size,
                sector_size,
            },
            image: Arc::new(vec![0u8; (cluster_size * clusters) as usize]),
            files: HashMap::new(),
            handles: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(Mutex::new(Vec::new())),
            reads: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            fail_snapshots: false,
            opened_devices: Mutex::new(Vec::new()),
        }
    }

    /// Make every snapshot request fail.
    pub(crate) fn with_failing_snapshots(mut self) -> Self {
        self.fail_snapshots = true;
        self
    }

    /// Live path of a registered file.
    pub(crate) fn path(&self, name: &str) -> PathBuf {
        Path::new(ROOT).join(name)
    }

    /// Register `data` laid out on the volume as `runs`.
    pub(crate) fn add_file(&mut self, name: &str, data: &[u8], runs: &[Run]) {
        let cs = self.info.cluster_size;
        let image = Arc::make_mut(&mut self.image);
        let mut extents = Vec::new();
        let mut vcn = 0u64;

        for run in runs {
            match *run {
                Run::Data(lcn, clusters) => {
                    let from = ((vcn * cs) as usize).min(data.len());
                    let to = (((vcn + clusters) * cs) as usize).min(data.len());
                    let at = (lcn * cs) as usize;
                    image[at..at + (to - from)].copy_from_slice(&data[from..to]);
                    extents.push(Extent::mapped(vcn, lcn, clusters));
                    vcn += clusters;
                }
                Run::Hole(clusters) => {
                    extents.push(Extent::hole(vcn, clusters));
                    vcn += clusters;
                }
            }
        }

        let table = ExtentTable::new(cs, extents).unwrap();
        self.add_table(name, data, table);
    }

    /// Register a file whose data lives in its MFT record.
    pub(crate) fn add_resident(&mut self, name: &str, data: &[u8]) {
        let table = ExtentTable::empty(self.info.cluster_size);
        self.add_table(name, data, table);
    }

    /// Register a file with an arbitrary table, leaving the image untouched.
    pub(crate) fn add_table(&mut self, name: &str, data: &[u8], table: ExtentTable) {
        self.files.insert(
            PathBuf::from(name),
            StoredFile {
                data: data.to_vec(),
                table,
            },
        );
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    /// Kinds of everything released so far, in release order: `source`,
    /// `reader`, `device` or `snapshot`.
    pub(crate) fn releases(&self) -> Vec<&'static str> {
        self.releases.lock().unwrap().clone()
    }

    pub(crate) fn device_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshots_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshots_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn opened_devices(&self) -> Vec<PathBuf> {
        self.opened_devices.lock().unwrap().clone()
    }

    fn live_snapshot_devices(&self) -> Vec<PathBuf> {
        let released = self.snapshots_released();
        let created = self.snapshots_created();
        (released + 1..=created)
            .map(|n| Path::new(SNAPSHOT_DIR).join(n.to_string()))
            .collect()
    }

    fn not_found(path: &Path) -> Error {
        Error::io(path, io::Error::from(io::ErrorKind::NotFound))
    }

    /// Resolve a live or snapshot path to a registered file name.
    fn lookup(&self, path: &Path) -> Result<(&Path, &StoredFile)> {
        let name = match path.strip_prefix(ROOT) {
            Ok(name) => name,
            Err(_) => {
                let in_snapshot = path
                    .strip_prefix(SNAPSHOT_DIR)
                    .map_err(|_| Self::not_found(path))?;
                let mut components = in_snapshot.components();
                components.next();
                components.as_path()
            }
        };
        self.files
            .get_key_value(name)
            .map(|(name, file)| (name.as_path(), file))
            .ok_or_else(|| Self::not_found(path))
    }
}

impl SnapshotProvider for MemoryVolume {
    fn create_snapshot(&self, volume_root: &Path) -> Result<Snapshot> {
        if self.fail_snapshots {
            return Err(Error::SnapshotCreationFailed {
                volume: volume_root.to_path_buf(),
                code: Some(6),
                message: "insufficient storage".to_string(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Snapshot {
            id: format!("{{{}}}", n),
            device_object: Path::new(SNAPSHOT_DIR).join(n.to_string()),
            volume_root: volume_root.to_path_buf(),
        })
    }

    fn release_snapshot(&self, _snapshot: &Snapshot) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.releases.lock().unwrap().push("snapshot");
        Ok(())
    }
}

impl Volume for MemoryVolume {
    type Source = MemorySource;
    type Reader = MemoryReader;
    type Device = MemoryDevice;

    fn describe(&self, path: &Path) -> Result<VolumeInfo> {
        self.lookup(path)?;
        Ok(self.info.clone())
    }

    fn open_source(&self, path: &Path) -> Result<MemorySource> {
        let (name, _) = self.lookup(path)?;
        Ok(MemorySource {
            name: name.to_path_buf(),
            _handle: HandleToken::new(self, "source"),
        })
    }

    fn source_len(&self, source: &MemorySource) -> Result<u64> {
        let (_, file) = self.lookup(&Path::new(ROOT).join(&source.name))?;
        Ok(file.data.len() as u64)
    }

    fn resolve_extents(&self, source: &MemorySource, _info: &VolumeInfo) -> Result<ExtentTable> {
        let (_, file) = self.lookup(&Path::new(ROOT).join(&source.name))?;
        Ok(file.table.clone())
    }

    fn open_reader(&self, path: &Path) -> Result<MemoryReader> {
        let (_, file) = self.lookup(path)?;
        Ok(MemoryReader {
            cursor: Cursor::new(file.data.clone()),
            _handle: HandleToken::new(self, "reader"),
        })
    }

    fn open_device(&self, path: &Path) -> Result<MemoryDevice> {
        let known = path == Path::new(DEVICE) || self.live_snapshot_devices().iter().any(|p| p == path);
        if !known {
            return Err(Error::VolumeOpenFailed {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        self.opened_devices.lock().unwrap().push(path.to_path_buf());
        Ok(MemoryDevice {
            image: Arc::clone(&self.image),
            reads: Arc::clone(&self.reads),
            _handle: HandleToken::new(self, "device"),
        })
    }
}

/// Records every callback, optionally cancelling after some reports.
#[derive(Default)]
pub(crate) struct RecordingProgress {
    pub(crate) phases: Mutex<Vec<Phase>>,
    pub(crate) reports: Mutex<Vec<ProgressReport>>,
    pub(crate) started_with: Mutex<Option<u64>>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl RecordingProgress {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` once `reports` progress reports have been seen.
    pub(crate) fn cancelling(reports: usize, token: CancelToken) -> Self {
        Self {
            cancel_after: Some((reports, token)),
            ..Self::default()
        }
    }

    pub(crate) fn phases(&self) -> Vec<Phase> {
        self.phases.lock().unwrap().clone()
    }

    pub(crate) fn copied(&self) -> Vec<u64> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.copied_bytes)
            .collect()
    }
}

impl Progress for RecordingProgress {
    fn on_phase(&self, phase: Phase) {
        self.phases.lock().unwrap().push(phase);
    }

    fn on_start(&self, total_bytes: u64) {
        *self.started_with.lock().unwrap() = Some(total_bytes);
    }

    fn on_progress(&self, report: &ProgressReport) {
        let mut reports = self.reports.lock().unwrap();
        reports.push(*report);
        if let Some((after, token)) = &self.cancel_after {
            if reports.len() >= *after {
                token.cancel();
            }
        }
    }
}

/// Deterministic non-zero test data.
pub(crate) fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(seed as u32) % 251) as u8 + 1)
        .collect()
}
