//! Disk identity, mount records and mount naming.
//!
//! A disk is identified by a normalized absolute path. Virtual disk files are
//! canonicalized so relative and absolute spellings of the same file map to
//! one identity. Pass-through device paths are only cleaned lexically, since
//! resolving `/dev/disk/by-id/...` links would trade a stable name for an
//! unstable one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use utoipa::ToSchema;

/// Kind of host disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    /// Physical disk passed through to the VM.
    PassThrough,
    /// Virtual disk image file.
    #[default]
    Virtual,
}

impl DiskKind {
    /// Get the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskKind::PassThrough => "pass_through",
            DiskKind::Virtual => "virtual",
        }
    }
}

impl fmt::Display for DiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized disk identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskId(PathBuf);

impl DiskId {
    /// Normalize a user-supplied path for a disk of `kind`.
    pub fn resolve(kind: DiskKind, input: impl AsRef<Path>) -> Result<Self> {
        let lexical = absolute(input.as_ref())?;
        match kind {
            DiskKind::PassThrough => Ok(Self(lexical)),
            DiskKind::Virtual => Ok(Self(std::fs::canonicalize(&lexical).unwrap_or(lexical))),
        }
    }

    /// Every identity `input` may have been recorded under.
    ///
    /// Used where the kind is unknown (unmount by path) or the file may be
    /// gone. The lexical form comes first.
    pub fn candidates(input: impl AsRef<Path>) -> Result<Vec<Self>> {
        let lexical = absolute(input.as_ref())?;
        let mut out = vec![Self(lexical.clone())];
        if let Ok(canonical) = std::fs::canonicalize(&lexical) {
            if canonical != lexical {
                out.push(Self(canonical));
            }
        }
        Ok(out)
    }

    /// Rebuild an identity read back from the state store.
    pub fn from_stored(path: &str) -> Self {
        Self(PathBuf::from(path))
    }

    /// Path of the disk.
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Key used in the state store.
    pub fn key(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }

    /// Default mount name: the alphanumeric characters of the identity,
    /// suffixed `p<N>` for partition N.
    pub fn default_mount_name(&self, partition: u32) -> String {
        let mut name: String = self
            .key()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if name.is_empty() {
            name.push_str("disk");
        }
        if partition != 0 {
            name.push_str(&format!("p{}", partition));
        }
        name
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Make `path` absolute against the current directory and clean it lexically.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::DiskNotFound {
            path: PathBuf::new(),
        });
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(clean(&joined))
}

/// Remove `.` and resolve `..` without touching the filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// One requested mount of a disk's partition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct MountRecord {
    /// 0 for the whole disk, N for partition N.
    pub partition: u32,
    /// Filesystem type, autodetected when absent.
    pub filesystem: Option<String>,
    /// Comma-separated mount options.
    pub options: Option<String>,
    /// Custom mount name replacing the default.
    pub name: Option<String>,
}

impl MountRecord {
    /// Record for `partition` with everything else defaulted.
    pub fn partition(partition: u32) -> Self {
        Self {
            partition,
            ..Default::default()
        }
    }

    /// Name the mountpoint will use for `disk`.
    pub fn mount_name(&self, disk: &DiskId) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => disk.default_mount_name(self.partition),
        }
    }
}

/// Check a caller-supplied mount name.
pub fn validate_mount_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name == "." || name == ".." {
        return Err("name is a relative path component");
    }
    if name.contains('/') {
        return Err("name contains '/'");
    }
    if name.contains('\0') {
        return Err("name contains NUL");
    }
    Ok(())
}

/// A completed mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MountInfo {
    /// Guest mountpoint path.
    pub path: String,
    /// Filesystem type the partition was mounted with.
    pub filesystem: String,
    /// Mount name (last path component).
    pub name: String,
}

/// A live attachment of a disk to the current VM instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskHandle {
    /// Disk identity.
    pub id: DiskId,
    /// Disk kind.
    pub kind: DiskKind,
    /// SCSI LUN assigned by the VM.
    pub lun: u32,
    /// Guest block device node.
    pub guest_device: String,
    /// Online state captured before attach. `None` for virtual disks and
    /// disks whose online state the host cannot control.
    pub was_online: Option<bool>,
    /// VM instance generation the attachment belongs to.
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_mount_name() {
        let id = DiskId::from_stored("/dev/sdb");
        assert_eq!(id.default_mount_name(0), "devsdb");
        assert_eq!(id.default_mount_name(3), "devsdbp3");

        let id = DiskId::from_stored("/home/user/disks/data-1.vhdx");
        assert_eq!(id.default_mount_name(1), "homeuserdisksdata1vhdxp1");
    }

    #[test]
    fn test_clean_resolves_dots() {
        assert_eq!(clean(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean(Path::new("/../a")), PathBuf::from("/a"));
    }

    #[test]
    fn test_pass_through_is_not_canonicalized() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("real");
        std::fs::write(&target, b"").unwrap();
        let link = tmp.path().join("by-id");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let id = DiskId::resolve(DiskKind::PassThrough, &link).unwrap();
        assert_eq!(id.path(), link.as_path());
    }

    #[test]
    fn test_virtual_relative_and_absolute_agree() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("disk.vhdx");
        std::fs::write(&file, b"").unwrap();

        let absolute = DiskId::resolve(DiskKind::Virtual, &file).unwrap();
        let dotted = tmp.path().join(".").join("sub").join("..").join("disk.vhdx");
        let relative = DiskId::resolve(DiskKind::Virtual, &dotted).unwrap();
        assert_eq!(absolute, relative);
    }

    #[test]
    fn test_validate_mount_name() {
        assert!(validate_mount_name("data").is_ok());
        assert!(validate_mount_name("a/b").is_err());
        assert!(validate_mount_name("").is_err());
        assert!(validate_mount_name("..").is_err());
    }

    #[test]
    fn test_mount_record_name() {
        let id = DiskId::from_stored("/dev/sdb");
        let mut record = MountRecord::partition(2);
        assert_eq!(record.mount_name(&id), "devsdbp2");
        record.name = Some("backup".to_string());
        assert_eq!(record.mount_name(&id), "backup");
    }
}
