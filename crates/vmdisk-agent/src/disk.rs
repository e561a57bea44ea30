//! Block device discovery inside the guest.
//!
//! Hot-added disks show up as SCSI devices under sysfs. The kernel creates
//! the block device (and its partitions) asynchronously, so lookups retry
//! for a bounded time on ENOENT/ENXIO.

use crate::error::{AgentError, Result};
use crate::paths::{
    BLKID_PATH, BLOCK_CLASS_DIR, DEVICE_RETRY_COUNT, DEVICE_RETRY_DELAY_MS, DEV_DIR,
    SCSI_DEVICES_DIR,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};
use vmdisk_protocol::errno;

/// Resolve the guest device node for a disk attached at `lun`.
pub fn resolve_device(lun: u32) -> Result<String> {
    with_retry(|| find_scsi_block(Path::new(SCSI_DEVICES_DIR), lun))
}

/// Check that a device node can be opened.
pub fn probe_device(device: &str) -> Result<()> {
    fs::File::open(device).map_err(|e| AgentError::io(format!("open {}", device), &e))?;
    Ok(())
}

/// Locate partition `index` (1-based) of `device`.
pub fn find_partition(device: &str, index: u32) -> Result<String> {
    with_retry(|| find_partition_in(Path::new(BLOCK_CLASS_DIR), device, index))
}

/// Detect the filesystem type of a device with blkid.
///
/// A device without a recognizable signature is EINVAL.
pub fn detect_filesystem(device: &str) -> Result<String> {
    let output = Command::new(BLKID_PATH)
        .args(["-p", "-u", "filesystem", "-s", "TYPE", "-o", "value", device])
        .output()
        .map_err(|e| AgentError::io("run blkid", &e))?;

    let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || fstype.is_empty() {
        debug!(device = %device, status = ?output.status.code(), "no filesystem signature");
        return Err(AgentError::new(
            errno::EINVAL,
            format!("no filesystem detected on {}", device),
        ));
    }

    info!(device = %device, fstype = %fstype, "detected filesystem");
    Ok(fstype)
}

/// Flush and delete the SCSI device at `lun` so the host can remove it.
///
/// A LUN that no longer exists is already released.
pub fn release_device(lun: u32) -> Result<()> {
    release_scsi_device(Path::new(SCSI_DEVICES_DIR), lun)
}

fn release_scsi_device(root: &Path, lun: u32) -> Result<()> {
    let Some(dir) = find_scsi_dir(root, lun)? else {
        debug!(lun, "device already gone");
        return Ok(());
    };

    nix::unistd::sync();

    let delete = dir.join("delete");
    match fs::write(&delete, "1") {
        Ok(()) => {
            info!(lun, "released device");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AgentError::io(format!("write {}", delete.display()), &e)),
    }
}

/// Find the sysfs directory of the SCSI device whose LUN is `lun`.
fn find_scsi_dir(root: &Path, lun: u32) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AgentError::io(format!("read {}", root.display()), &e)),
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let parts: Vec<&str> = name.split(':').collect();
        if parts.len() != 4 {
            continue;
        }
        if parts[3].parse::<u32>().ok() == Some(lun) {
            return Ok(Some(entry.path()));
        }
    }

    Ok(None)
}

fn find_scsi_block(root: &Path, lun: u32) -> Result<String> {
    let missing = || AgentError::new(errno::ENOENT, format!("no block device for lun {}", lun));

    let dir = find_scsi_dir(root, lun)?.ok_or_else(missing)?;
    let block = fs::read_dir(dir.join("block")).map_err(|_| missing())?;

    block
        .flatten()
        .next()
        .map(|dev| format!("{}/{}", DEV_DIR, dev.file_name().to_string_lossy()))
        .ok_or_else(missing)
}

fn find_partition_in(class_root: &Path, device: &str, index: u32) -> Result<String> {
    let name = Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AgentError::new(errno::EINVAL, format!("bad device path {}", device)))?;

    let disk_dir = class_root.join(&name);
    let entries = fs::read_dir(&disk_dir)
        .map_err(|e| AgentError::io(format!("read {}", disk_dir.display()), &e))?;

    for entry in entries.flatten() {
        let Ok(content) = fs::read_to_string(entry.path().join("partition")) else {
            continue;
        };
        if content.trim().parse::<u32>().ok() == Some(index) {
            return Ok(format!(
                "{}/{}",
                DEV_DIR,
                entry.file_name().to_string_lossy()
            ));
        }
    }

    Err(AgentError::new(
        errno::ENOENT,
        format!("partition {} not found on {}", index, device),
    ))
}

fn with_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(e) if e.is_transient() && attempt + 1 < DEVICE_RETRY_COUNT => {
                attempt += 1;
                if attempt == 1 {
                    debug!(error = %e, "device not ready, retrying");
                }
                std::thread::sleep(Duration::from_millis(DEVICE_RETRY_DELAY_MS));
            }
            Err(e) => {
                if attempt > 0 {
                    warn!(error = %e, attempts = attempt + 1, "device lookup gave up");
                }
                return Err(e);
            }
            ok => return ok,
        }
    }
}
