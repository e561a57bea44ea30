//! JSON request and response types for the API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use vmdisk_protocol::MountStatus;

use crate::disk::{DiskKind, MountRecord};
use crate::manager::DiskStatus;

// ============================================================================
// Disk Types
// ============================================================================

/// Request to attach a disk without mounting it.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AttachRequest {
    /// Disk image path or pass-through device path.
    pub disk: String,
    /// Disk kind.
    #[serde(default)]
    pub kind: DiskKind,
}

/// Attached disk.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AttachResponse {
    /// Normalized disk identity.
    pub disk: String,
    /// SCSI LUN on the VM.
    pub lun: u32,
    /// Guest block device.
    pub device: String,
}

/// Request to mount one partition of a disk.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MountRequest {
    /// Disk image path or pass-through device path.
    pub disk: String,
    /// Disk kind.
    #[serde(default)]
    pub kind: DiskKind,
    /// Partition index, 0 for the whole disk.
    #[serde(default)]
    pub partition: u32,
    /// Filesystem type. Detected when absent.
    #[serde(default)]
    pub filesystem: Option<String>,
    /// Comma-separated mount options.
    #[serde(default)]
    pub options: Option<String>,
    /// Mount name replacing the default.
    #[serde(default)]
    pub name: Option<String>,
}

impl MountRequest {
    /// The mount record this request asks for.
    pub fn record(&self) -> MountRecord {
        MountRecord {
            partition: self.partition,
            filesystem: self.filesystem.clone(),
            options: self.options.clone(),
            name: self.name.clone(),
        }
    }
}

/// Successful mount.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MountResponse {
    /// 0.
    pub result: i32,
    /// Stage code of the result.
    pub step: u32,
    /// Guest mountpoint.
    pub path: String,
    /// Filesystem type mounted.
    pub filesystem: String,
}

impl MountResponse {
    /// Response for a mount at `path`.
    pub fn mounted(path: String, filesystem: String) -> Self {
        let status = MountStatus::mounted();
        Self {
            result: status.result,
            step: status.step.code(),
            path,
            filesystem,
        }
    }
}

/// Request to unmount a disk, or every disk when `disk` is absent.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct UnmountRequest {
    /// Disk image path or pass-through device path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
}

/// List disks response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListDisksResponse {
    /// Persisted and attached disks.
    pub disks: Vec<DiskStatus>,
}

// ============================================================================
// Health Types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Health status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Whether the utility VM is running.
    pub vm_running: bool,
}
