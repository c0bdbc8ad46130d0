//! Point-in-time volume snapshots.
//!
//! A snapshot gives the copy a frozen view of the source volume, so files
//! that change while they are being copied still come out consistent. On
//! Windows, snapshots are client-accessible shadow copies created through the
//! `Win32_ShadowCopy` CIM class. Each copy creates its own snapshot and
//! releases it through [`SnapshotGuard`] when it finishes, whatever the
//! outcome.

use crate::error::{Error, Result};

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// A live snapshot of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Identifier assigned by the snapshot service.
    pub id: String,
    /// Device object exposing the snapshot, e.g.
    /// `\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy3`.
    pub device_object: PathBuf,
    /// Root of the volume the snapshot was taken of.
    pub volume_root: PathBuf,
}

impl Snapshot {
    /// Map a path on the live volume to the same file inside the snapshot.
    pub fn translate(&self, path: &Path) -> Result<PathBuf> {
        let relative = path.strip_prefix(&self.volume_root).map_err(|_| {
            Error::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path is not on volume {}", self.volume_root.display()),
                ),
            )
        })?;
        Ok(self.device_object.join(relative))
    }
}

/// Creates and removes snapshots.
pub trait SnapshotProvider {
    /// Create a read-only snapshot of the volume mounted at `volume_root`,
    /// waiting until it is usable.
    fn create_snapshot(&self, volume_root: &Path) -> Result<Snapshot>;

    /// Remove a snapshot created by this provider.
    fn release_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Owns a snapshot and releases it exactly once.
///
/// Release happens on the first call to [`release`](SnapshotGuard::release)
/// or when the guard is dropped, including during unwinding.
#[derive(Debug)]
pub struct SnapshotGuard<'a, P: SnapshotProvider + ?Sized> {
    provider: &'a P,
    snapshot: Option<Snapshot>,
}

impl<'a, P: SnapshotProvider + ?Sized> SnapshotGuard<'a, P> {
    /// Create a snapshot of `volume_root` and take ownership of it.
    pub fn acquire(provider: &'a P, volume_root: &Path) -> Result<Self> {
        let snapshot = provider.create_snapshot(volume_root)?;
        info!(
            id = %snapshot.id,
            device = %snapshot.device_object.display(),
            "snapshot created"
        );
        Ok(Self::new(provider, snapshot))
    }

    /// Take ownership of a snapshot created by `provider`.
    pub fn new(provider: &'a P, snapshot: Snapshot) -> Self {
        Self {
            provider,
            snapshot: Some(snapshot),
        }
    }

    /// The snapshot, until it has been released.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Release the snapshot. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(snapshot) => {
                self.provider.release_snapshot(&snapshot)?;
                info!(id = %snapshot.id, "snapshot released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl<P: SnapshotProvider + ?Sized> Drop for SnapshotGuard<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}

/// Shadow copy provider driving `Win32_ShadowCopy` through PowerShell.
#[derive(Debug, Clone)]
pub struct ShadowCopyProvider {
    powershell: PathBuf,
}

impl Default for ShadowCopyProvider {
    fn default() -> Self {
        Self {
            powershell: PathBuf::from("powershell.exe"),
        }
    }
}

impl ShadowCopyProvider {
    /// Use the PowerShell found on `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific PowerShell executable.
    pub fn with_powershell(mut self, powershell: impl Into<PathBuf>) -> Self {
        self.powershell = powershell.into();
        self
    }

    fn run(&self, script: &str) -> std::io::Result<std::process::Output> {
        Command::new(&self.powershell)
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
    }
}

impl SnapshotProvider for ShadowCopyProvider {
    fn create_snapshot(&self, volume_root: &Path) -> Result<Snapshot> {
        let failed = |code: Option<u32>, message: String| Error::SnapshotCreationFailed {
            volume: volume_root.to_path_buf(),
            code,
            message,
        };

        let output = self
            .run(&create_script(volume_root))
            .map_err(|e| failed(None, format!("failed to run PowerShell: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        match parse_create_output(&stdout) {
            Ok(CreateOutput::Created { id, device_object }) => Ok(Snapshot {
                id,
                device_object: PathBuf::from(device_object),
                volume_root: volume_root.to_path_buf(),
            }),
            Ok(CreateOutput::Failed(code)) => Err(failed(
                Some(code),
                format!("Win32_ShadowCopy.Create returned {}: {}", code, describe_return_value(code)),
            )),
            Ok(CreateOutput::Unresolved { id }) => {
                // Created but unusable; nothing downstream will own it.
                self.discard(&id);
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(failed(
                    None,
                    format!(
                        "shadow copy {} was created but its device could not be looked up \
                         (PowerShell said: {})",
                        id,
                        stderr.trim()
                    ),
                ))
            }
            Err(message) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(failed(
                    None,
                    format!("{} (PowerShell said: {})", message, stderr.trim()),
                ))
            }
        }
    }

    fn release_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.delete(&snapshot.id)
    }
}

impl ShadowCopyProvider {
    fn delete(&self, id: &str) -> Result<()> {
        let failed = |message: String| Error::SnapshotReleaseFailed {
            id: id.to_string(),
            message,
        };

        let script = delete_script(id).map_err(failed)?;
        let output = self
            .run(&script)
            .map_err(|e| failed(format!("failed to run PowerShell: {}", e)))?;
        if !output.status.success() {
            return Err(failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// Best-effort removal of a shadow copy that never reached a guard.
    fn discard(&self, id: &str) {
        match self.delete(id) {
            Ok(()) => info!(id, "removed incomplete shadow copy"),
            Err(e) => warn!(id, "failed to remove incomplete shadow copy: {}", e),
        }
    }
}

/// Parsed result of the creation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CreateOutput {
    Created { id: String, device_object: String },
    /// The shadow copy exists but its device object is unknown.
    Unresolved { id: String },
    Failed(u32),
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `Win32_ShadowCopy.Create` expects the volume root with a trailing
/// separator, e.g. `C:\`.
fn volume_argument(volume_root: &Path) -> String {
    let root = volume_root.to_string_lossy();
    if root.ends_with('\\') {
        root.into_owned()
    } else {
        format!("{}\\", root)
    }
}

pub(crate) fn create_script(volume_root: &Path) -> String {
    format!(
        "$ErrorActionPreference = 'Stop'\n\
         $r = Invoke-CimMethod -ClassName Win32_ShadowCopy -MethodName Create \
         -Arguments @{{ Volume = {}; Context = 'ClientAccessible' }}\n\
         Write-Output \"ReturnValue=$($r.ReturnValue)\"\n\
         if ($r.ReturnValue -ne 0) {{ exit 1 }}\n\
         Write-Output \"ShadowID=$($r.ShadowID)\"\n\
         $s = Get-CimInstance -ClassName Win32_ShadowCopy -Filter \"ID='$($r.ShadowID)'\"\n\
         Write-Output \"DeviceObject=$($s.DeviceObject)\"",
        quote(&volume_argument(volume_root))
    )
}

pub(crate) fn delete_script(id: &str) -> std::result::Result<String, String> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_hexdigit() || matches!(c, '{' | '}' | '-'));
    if !valid {
        return Err(format!("refusing to delete malformed snapshot id {:?}", id));
    }
    Ok(format!(
        "$ErrorActionPreference = 'Stop'\n\
         Get-CimInstance -ClassName Win32_ShadowCopy -Filter \"ID='{}'\" | Remove-CimInstance",
        id
    ))
}

pub(crate) fn parse_create_output(stdout: &str) -> std::result::Result<CreateOutput, String> {
    let mut return_value = None;
    let mut id = None;
    let mut device_object = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key {
            "ReturnValue" => {
                return_value = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| format!("unexpected ReturnValue {:?}", value))?,
                )
            }
            "ShadowID" if !value.is_empty() => id = Some(value.to_string()),
            "DeviceObject" if !value.is_empty() => device_object = Some(value.to_string()),
            _ => {}
        }
    }

    match (return_value, id, device_object) {
        (None, _, _) => Err("shadow copy request produced no return value".to_string()),
        (Some(0), Some(id), Some(device_object)) => Ok(CreateOutput::Created { id, device_object }),
        (Some(0), Some(id), None) => Ok(CreateOutput::Unresolved { id }),
        (Some(0), None, _) => Err("shadow copy was created but reported no id".to_string()),
        (Some(code), _, _) => Ok(CreateOutput::Failed(code)),
    }
}

/// Meaning of a `Win32_ShadowCopy.Create` return value.
pub fn describe_return_value(code: u32) -> &'static str {
    match code {
        0 => "success",
        1 => "access denied",
        2 => "invalid argument",
        3 => "specified volume not found",
        4 => "specified volume not supported",
        5 => "unsupported shadow copy context",
        6 => "insufficient storage",
        7 => "volume is in use",
        8 => "maximum number of shadow copies reached",
        9 => "another shadow copy operation is already in progress",
        10 => "shadow copy provider vetoed the operation",
        11 => "shadow copy provider not registered",
        12 => "shadow copy provider failure",
        _ => "unknown error",
    }
}
