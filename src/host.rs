//! Host-side disk control.
//!
//! A pass-through disk must be offline on the host while the VM owns it.
//! The [`HostDisks`] trait covers existence, exclusive-use checks and the
//! online/offline switch.

use crate::disk::{DiskId, DiskKind};
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Host disk control.
pub trait HostDisks: Send + Sync {
    /// Whether the disk path or device exists.
    fn exists(&self, disk: &DiskId) -> bool;

    /// Fail with `DiskInUse` if the host holds the disk exclusively.
    fn check_available(&self, disk: &DiskId, kind: DiskKind) -> Result<()>;

    /// Current online state of a pass-through disk, or `None` when the
    /// host cannot switch it.
    fn is_online(&self, disk: &DiskId) -> Result<Option<bool>>;

    /// Bring a pass-through disk online or take it offline.
    fn set_online(&self, disk: &DiskId, online: bool) -> Result<()>;
}

/// Host disk control through device nodes and sysfs.
pub struct SystemHost {
    class_root: PathBuf,
}

impl SystemHost {
    /// Use the live `/sys/class/block`.
    pub fn new() -> Self {
        Self::with_sysfs("/sys/class/block")
    }

    /// Use an alternative block class directory.
    pub fn with_sysfs(class_root: impl Into<PathBuf>) -> Self {
        Self {
            class_root: class_root.into(),
        }
    }

    /// sysfs `device/state` attribute of a block device.
    fn state_file(&self, disk: &DiskId) -> Option<PathBuf> {
        let resolved = std::fs::canonicalize(disk.path()).unwrap_or_else(|_| disk.path().to_path_buf());
        let name = resolved.file_name()?;
        let path = self.class_root.join(name).join("device").join("state");
        path.exists().then_some(path)
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDisks for SystemHost {
    fn exists(&self, disk: &DiskId) -> bool {
        disk.path().exists()
    }

    fn check_available(&self, disk: &DiskId, kind: DiskKind) -> Result<()> {
        match kind {
            DiskKind::PassThrough => check_block_device(disk.path()),
            DiskKind::Virtual => check_image_file(disk.path()),
        }
    }

    fn is_online(&self, disk: &DiskId) -> Result<Option<bool>> {
        let Some(path) = self.state_file(disk) else {
            debug!(disk = %disk, "no device state attribute");
            return Ok(None);
        };
        let state = std::fs::read_to_string(&path)
            .map_err(|e| Error::host_state(disk.path(), e.to_string()))?;
        Ok(Some(state.trim() != "offline"))
    }

    fn set_online(&self, disk: &DiskId, online: bool) -> Result<()> {
        let path = self
            .state_file(disk)
            .ok_or_else(|| Error::host_state(disk.path(), "device state is not controllable"))?;
        let value = if online { "running" } else { "offline" };
        std::fs::write(&path, value).map_err(|e| Error::host_state(disk.path(), e.to_string()))?;
        debug!(disk = %disk, online, "changed host disk state");
        Ok(())
    }
}

/// A block device opened with O_EXCL fails with EBUSY while mounted or
/// claimed by another holder.
fn check_block_device(path: &Path) -> Result<()> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    #[cfg(target_os = "linux")]
    opts.custom_flags(libc::O_EXCL);

    match opts.open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
            Err(Error::in_use(path, "device is mounted or held by the host"))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::DiskNotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(Error::in_use(path, e.to_string())),
    }
}

/// An image file is in use when another process holds a lock on it.
fn check_image_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new().read(true).open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::DiskNotFound {
                path: path.to_path_buf(),
            }
        } else {
            Error::in_use(path, e.to_string())
        }
    })?;

    // SAFETY: the descriptor is valid for the lifetime of `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::in_use(path, format!("locked by another process: {}", err)));
    }
    // The lock is released when `file` is dropped.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(dir: &TempDir, name: &str, state: &str) -> PathBuf {
        let device = dir.path().join("class").join(name).join("device");
        std::fs::create_dir_all(&device).unwrap();
        std::fs::write(device.join("state"), state).unwrap();
        dir.path().join("class")
    }

    #[test]
    fn test_online_state_from_sysfs() {
        let dir = TempDir::new().unwrap();
        let class = fake_sysfs(&dir, "sdb", "running\n");
        let host = SystemHost::with_sysfs(class);
        let disk = DiskId::from_stored("/dev/sdb");

        assert_eq!(host.is_online(&disk).unwrap(), Some(true));
        host.set_online(&disk, false).unwrap();
        assert_eq!(host.is_online(&disk).unwrap(), Some(false));
        host.set_online(&disk, true).unwrap();
        assert_eq!(host.is_online(&disk).unwrap(), Some(true));
    }

    #[test]
    fn test_uncontrollable_disk() {
        let dir = TempDir::new().unwrap();
        let host = SystemHost::with_sysfs(dir.path());
        let disk = DiskId::from_stored("/dev/vdz");

        assert_eq!(host.is_online(&disk).unwrap(), None);
        assert!(matches!(
            host.set_online(&disk, false),
            Err(Error::HostDiskState { .. })
        ));
    }

    #[test]
    fn test_locked_image_is_in_use() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, b"").unwrap();
        let host = SystemHost::new();
        let disk = DiskId::from_stored(image.to_str().unwrap());

        host.check_available(&disk, DiskKind::Virtual).unwrap();

        let holder = std::fs::File::open(&image).unwrap();
        let rc = unsafe { libc::flock(holder.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(rc, 0);

        assert!(matches!(
            host.check_available(&disk, DiskKind::Virtual),
            Err(Error::DiskInUse { .. })
        ));
    }

    #[test]
    fn test_missing_image_is_not_found() {
        let host = SystemHost::new();
        let disk = DiskId::from_stored("/nonexistent/vmdisk/disk.img");
        assert!(!host.exists(&disk));
        assert!(host
            .check_available(&disk, DiskKind::Virtual)
            .unwrap_err()
            .is_not_found());
    }
}
