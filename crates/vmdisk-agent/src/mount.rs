//! Mountpoint management and mount(2)/umount(2) wrappers.

use crate::error::{AgentError, Result};
use nix::mount::{mount as sys_mount, umount as sys_umount, MsFlags};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use vmdisk_protocol::errno;

/// Mount options split into kernel flags and filesystem data.
#[derive(Debug, PartialEq, Eq)]
pub struct MountOptions {
    /// Flags understood by mount(2) itself.
    pub flags: MsFlags,
    /// Remaining comma-separated options handed to the filesystem.
    pub data: Option<String>,
}

/// Split a comma-separated option string like mount(8) does.
///
/// Unknown options are passed through to the filesystem unchanged.
pub fn parse_options(options: Option<&str>) -> MountOptions {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for opt in options.unwrap_or("").split(',').map(str::trim) {
        match opt {
            "" | "defaults" | "rw" | "suid" | "dev" | "exec" | "async" | "atime" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            other => data.push(other),
        }
    }

    MountOptions {
        flags,
        data: if data.is_empty() {
            None
        } else {
            Some(data.join(","))
        },
    }
}

/// Create a mountpoint directory.
///
/// An existing empty directory is reused. A non-empty one is ENOTEMPTY and a
/// non-directory is EEXIST.
pub fn create_mountpoint(path: &str) -> Result<()> {
    let dir = Path::new(path);
    match fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => {
            return Err(AgentError::new(
                errno::EEXIST,
                format!("{} exists and is not a directory", path),
            ))
        }
        Ok(_) => {
            let mut entries =
                fs::read_dir(dir).map_err(|e| AgentError::io(format!("read {}", path), &e))?;
            if entries.next().is_some() {
                return Err(AgentError::new(
                    errno::ENOTEMPTY,
                    format!("mountpoint {} is not empty", path),
                ));
            }
            debug!(path = %path, "reusing empty mountpoint");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| AgentError::io(format!("mkdir {}", path), &e))
        }
        Err(e) => Err(AgentError::io(format!("stat {}", path), &e)),
    }
}

/// Remove a mountpoint directory. A missing directory is not an error.
pub fn remove_mountpoint(path: &str) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AgentError::io(format!("rmdir {}", path), &e)),
    }
}

/// Mount `source` on `target`.
pub fn mount(source: &str, target: &str, fstype: &str, options: Option<&str>) -> Result<()> {
    let parsed = parse_options(options);
    debug!(
        source = %source,
        target = %target,
        fstype = %fstype,
        flags = ?parsed.flags,
        data = ?parsed.data,
        "mounting"
    );

    sys_mount(
        Some(source),
        target,
        Some(fstype),
        parsed.flags,
        parsed.data.as_deref(),
    )
    .map_err(|e| AgentError::new(e as i32, format!("mount {} on {}: {}", source, target, e.desc())))?;

    info!(source = %source, target = %target, fstype = %fstype, "mounted");
    Ok(())
}

/// Unmount `target`.
pub fn unmount(target: &str) -> Result<()> {
    sys_umount(target)
        .map_err(|e| AgentError::new(e as i32, format!("umount {}: {}", target, e.desc())))?;
    info!(target = %target, "unmounted");
    Ok(())
}
