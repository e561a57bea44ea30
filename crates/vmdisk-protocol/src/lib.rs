//! Protocol types for vmdisk host-guest communication.
//!
//! This crate defines the wire protocol spoken between the vmdisk host
//! service and the guest agent running inside the utility VM, plus the
//! stable mount step enumeration reported to callers of `MountDisk`.
//!
//! # Protocol Overview
//!
//! Communication uses JSON-encoded messages over vsock. Each message is
//! prefixed with a 4-byte big-endian length header.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4 BE)  | JSON payload      |
//! +----------------+-------------------+
//! ```

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (1 MB). Requests and responses are small.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Well-known vsock ports.
pub mod ports {
    /// Guest agent control port.
    pub const AGENT_CONTROL: u32 = 6100;
}

/// Linux errno values as reported by the guest.
///
/// The guest is always Linux, so these do not depend on the host platform.
pub mod errno {
    /// Operation not permitted.
    pub const EPERM: i32 = 1;
    /// No such file or directory.
    pub const ENOENT: i32 = 2;
    /// I/O error.
    pub const EIO: i32 = 5;
    /// No such device or address.
    pub const ENXIO: i32 = 6;
    /// Device or resource busy.
    pub const EBUSY: i32 = 16;
    /// File exists.
    pub const EEXIST: i32 = 17;
    /// No such device.
    pub const ENODEV: i32 = 19;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// Directory not empty.
    pub const ENOTEMPTY: i32 = 39;

    /// Short symbolic name for an errno value, for diagnostics.
    pub fn name(errno: i32) -> &'static str {
        match errno.abs() {
            EPERM => "EPERM",
            ENOENT => "ENOENT",
            EIO => "EIO",
            ENXIO => "ENXIO",
            EBUSY => "EBUSY",
            EEXIST => "EEXIST",
            ENODEV => "ENODEV",
            EINVAL => "EINVAL",
            ENOTEMPTY => "ENOTEMPTY",
            _ => "EUNKNOWN",
        }
    }
}

// ============================================================================
// Mount Pipeline Steps
// ============================================================================

/// Stage of the partition mount pipeline.
///
/// The numeric codes are part of the external contract and must never be
/// renumbered. New stages get new codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum MountStep {
    /// No stage was entered.
    None,
    /// Validate that the attached disk is still live in the guest.
    OpenDisk,
    /// Locate the requested partition on the disk.
    FindPartition,
    /// Mount the device at the resolved mountpoint.
    Mount,
    /// Unmount a mountpoint.
    Unmount,
    /// Remove a mountpoint directory.
    RemoveMountpoint,
    /// Probe the device for a filesystem signature.
    DetectFilesystem,
    /// Compute the mountpoint path and check for collisions.
    ResolveMountpoint,
    /// Create the mountpoint directory.
    CreateMountpointDirectory,
    /// Release the device in the guest and detach it from the VM.
    Detach,
}

impl MountStep {
    /// All steps, in code order.
    pub const ALL: [MountStep; 10] = [
        MountStep::None,
        MountStep::OpenDisk,
        MountStep::FindPartition,
        MountStep::Mount,
        MountStep::Unmount,
        MountStep::RemoveMountpoint,
        MountStep::DetectFilesystem,
        MountStep::ResolveMountpoint,
        MountStep::CreateMountpointDirectory,
        MountStep::Detach,
    ];

    /// Stable numeric code of this step.
    pub const fn code(self) -> u32 {
        match self {
            MountStep::None => 0,
            MountStep::OpenDisk => 1,
            MountStep::FindPartition => 2,
            MountStep::Mount => 3,
            MountStep::Unmount => 4,
            MountStep::RemoveMountpoint => 5,
            MountStep::DetectFilesystem => 6,
            MountStep::ResolveMountpoint => 7,
            MountStep::CreateMountpointDirectory => 8,
            MountStep::Detach => 9,
        }
    }

    /// Look up a step by its numeric code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.code() == code)
    }

    /// Get the step name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            MountStep::None => "none",
            MountStep::OpenDisk => "open-disk",
            MountStep::FindPartition => "find-partition",
            MountStep::Mount => "mount",
            MountStep::Unmount => "unmount",
            MountStep::RemoveMountpoint => "remove-mountpoint",
            MountStep::DetectFilesystem => "detect-filesystem",
            MountStep::ResolveMountpoint => "resolve-mountpoint",
            MountStep::CreateMountpointDirectory => "create-mountpoint-directory",
            MountStep::Detach => "detach",
        }
    }
}

impl std::fmt::Display for MountStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<MountStep> for u32 {
    fn from(step: MountStep) -> Self {
        step.code()
    }
}

impl TryFrom<u32> for MountStep {
    type Error = UnknownStep;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        MountStep::from_code(code).ok_or(UnknownStep(code))
    }
}

/// A step code that does not name any known stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownStep(pub u32);

impl std::fmt::Display for UnknownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown mount step code {}", self.0)
    }
}

impl std::error::Error for UnknownStep {}

/// Result of a `MountDisk`/`UnmountDisk` call as seen by callers.
///
/// `result` is 0 on success or a negative errno. `step` names the stage
/// that produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountStatus {
    /// 0 on success, negative errno on failure.
    pub result: i32,
    /// Stage the result was produced at.
    pub step: MountStep,
}

impl MountStatus {
    /// Status of a completed mount.
    pub const fn mounted() -> Self {
        Self {
            result: 0,
            step: MountStep::Mount,
        }
    }

    /// Status of a call that did not touch the pipeline.
    pub const fn none() -> Self {
        Self {
            result: 0,
            step: MountStep::None,
        }
    }

    /// Failure status at `step` with a positive `errno`.
    pub const fn failed(errno: i32, step: MountStep) -> Self {
        Self {
            result: -errno.abs(),
            step,
        }
    }

    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        self.result == 0
    }
}

// ============================================================================
// Agent Protocol
// ============================================================================

/// Requests from the host to the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Ping to check if the agent is alive.
    Ping,

    /// Resolve the guest block device for a SCSI LUN.
    ResolveDevice {
        /// LUN the disk was attached at.
        lun: u32,
    },

    /// Check that a block device can be opened.
    ProbeDevice {
        /// Device path (e.g., "/dev/sdc").
        device: String,
    },

    /// Locate a partition on a block device.
    FindPartition {
        /// Device path of the whole disk.
        device: String,
        /// 1-based partition index.
        index: u32,
    },

    /// Detect the filesystem type on a block device.
    DetectFilesystem {
        /// Device or partition path.
        device: String,
    },

    /// Create a mountpoint directory.
    CreateMountpoint {
        /// Absolute guest path.
        path: String,
    },

    /// Mount a device.
    Mount {
        /// Device or partition path.
        source: String,
        /// Mountpoint.
        target: String,
        /// Filesystem type.
        fstype: String,
        /// Comma-separated mount options.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<String>,
    },

    /// Unmount a mountpoint.
    Unmount {
        /// Mountpoint.
        target: String,
    },

    /// Remove a mountpoint directory.
    RemoveMountpoint {
        /// Absolute guest path.
        path: String,
    },

    /// Flush and drop a device before it is detached from the VM.
    ReleaseDevice {
        /// LUN the disk was attached at.
        lun: u32,
    },

    /// Shutdown the agent.
    Shutdown,
}

/// Responses from the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResponse {
    /// Operation completed successfully.
    Ok {
        /// Response data (varies by request type).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// Pong response to ping.
    Pong {
        /// Protocol version.
        version: u32,
    },

    /// Operation failed.
    Error {
        /// Positive errno describing the failure.
        errno: i32,
        /// Human-readable message.
        message: String,
    },
}

impl AgentResponse {
    /// Successful response without data.
    pub fn ok() -> Self {
        AgentResponse::Ok { data: None }
    }

    /// Successful response carrying a single string value.
    pub fn ok_value(value: impl Into<String>) -> Self {
        AgentResponse::Ok {
            data: Some(serde_json::Value::String(value.into())),
        }
    }

    /// Error response.
    pub fn error(errno: i32, message: impl Into<String>) -> Self {
        AgentResponse::Error {
            errno: errno.abs(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a message to wire format (length-prefixed JSON).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a message from wire format.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::TooShort);
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if len > MAX_FRAME_SIZE as usize {
        return Err(DecodeError::TooLarge(len));
    }

    if data.len() < 4 + len {
        return Err(DecodeError::Incomplete {
            expected: len,
            got: data.len() - 4,
        });
    }

    serde_json::from_slice(&data[4..4 + len]).map_err(DecodeError::Json)
}

/// Error decoding a wire message.
#[derive(Debug)]
pub enum DecodeError {
    /// Data too short to contain length header.
    TooShort,
    /// Frame size exceeds maximum.
    TooLarge(usize),
    /// Incomplete frame.
    Incomplete {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },
    /// JSON parse error.
    Json(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooShort => write!(f, "data too short for length header"),
            DecodeError::TooLarge(size) => write!(f, "frame too large: {} bytes", size),
            DecodeError::Incomplete { expected, got } => {
                write!(f, "incomplete frame: expected {} bytes, got {}", expected, got)
            }
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}
