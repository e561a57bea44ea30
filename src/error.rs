//! Error types for vmdisk.

use crate::mount::{MountFailure, UnmountFailure};
use std::path::PathBuf;
use thiserror::Error;
use vmdisk_protocol::{errno, MountStatus, MountStep};

/// Result type alias using vmdisk's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vmdisk operations.
#[derive(Error, Debug)]
pub enum Error {
    // Host resource errors
    /// Disk path or device does not exist.
    #[error("disk not found: {}", path.display())]
    DiskNotFound {
        /// Path to the disk.
        path: PathBuf,
    },

    /// The host holds an exclusive lock on the disk.
    #[error("disk in use: {} ({reason})", path.display())]
    DiskInUse {
        /// Path to the disk.
        path: PathBuf,
        /// What holds it.
        reason: String,
    },

    /// No VM-capable runtime is registered.
    #[error("unsupported host configuration: {0}")]
    UnsupportedHostConfiguration(String),

    /// Changing the online/offline state of a host disk failed.
    #[error("host disk state change failed for {}: {message}", path.display())]
    HostDiskState {
        /// Path to the disk.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// The disk is not attached to the VM.
    #[error("disk not attached: {0}")]
    NotAttached(String),

    // Guest pipeline errors
    /// A stage of the mount pipeline failed.
    #[error("mount failed: {0}")]
    MountFailed(MountFailure),

    /// A stage of the unmount path failed.
    #[error("unmount failed: {0}")]
    UnmountFailed(UnmountFailure),

    // VM errors
    /// VM runtime error.
    #[error("vm error: {0}")]
    Vm(String),

    /// Guest agent error.
    #[error("agent operation failed: {operation}: {reason}")]
    Agent {
        /// What was being attempted.
        operation: String,
        /// Why it failed.
        reason: String,
    },

    // Persistence and configuration errors
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // Command execution errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // Service errors
    /// No `vmdisk serve` answers on the configured address.
    #[error("service not reachable: {0}")]
    ServiceUnavailable(String),

    /// The service answered with an error or an unreadable response.
    #[error("service error: {0}")]
    Service(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a disk-in-use error.
    pub fn in_use(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DiskInUse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a host disk state error.
    pub fn host_state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::HostDiskState {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a VM error with a message.
    pub fn vm(msg: impl Into<String>) -> Self {
        Self::Vm(msg.into())
    }

    /// Create an agent error for a failed operation.
    pub fn agent(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Agent {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Positive errno closest to this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::DiskNotFound { .. } => errno::ENOENT,
            Error::DiskInUse { .. } => errno::EBUSY,
            Error::UnsupportedHostConfiguration(_) => errno::ENODEV,
            Error::NotAttached(_) => errno::ENXIO,
            Error::MountFailed(f) | Error::UnmountFailed(f) => f.errno.abs(),
            Error::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
            _ => errno::EIO,
        }
    }

    /// `{result, step}` pair for this error. Failures outside the mount
    /// pipeline report [`MountStep::None`].
    pub fn status(&self) -> MountStatus {
        match self {
            Error::MountFailed(f) | Error::UnmountFailed(f) => (*f).into(),
            other => MountStatus::failed(other.errno(), MountStep::None),
        }
    }

    /// Whether the error refers to a missing disk.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DiskNotFound { .. })
    }
}

impl From<MountFailure> for Error {
    fn from(failure: MountFailure) -> Self {
        Error::MountFailed(failure)
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages should include context that helps users fix the problem.

    #[test]
    fn test_disk_not_found_includes_path() {
        let err = Error::DiskNotFound {
            path: PathBuf::from("/nonexistent/disk.vhdx"),
        };
        assert!(err.to_string().contains("/nonexistent/disk.vhdx"));
    }

    #[test]
    fn test_in_use_includes_reason() {
        let err = Error::in_use("/dev/sdb", "device busy");
        let msg = err.to_string();
        assert!(msg.contains("/dev/sdb"), "Error should include the disk");
        assert!(msg.contains("device busy"), "Error should say why");
    }

    #[test]
    fn test_mount_failed_includes_stage() {
        let err = Error::from(MountFailure::new(errno::EINVAL, MountStep::Mount));
        let msg = err.to_string();
        assert!(msg.contains("mount"), "Error should name the stage");
        assert!(msg.contains("-22"), "Error should include the errno");
    }

    #[test]
    fn test_status_of_attach_error() {
        let err = Error::in_use("/dev/sdb", "device busy");
        let status = err.status();
        assert_eq!(status.result, -errno::EBUSY);
        assert_eq!(status.step, MountStep::None);

        let err = Error::from(MountFailure::new(errno::ENOENT, MountStep::FindPartition));
        assert_eq!(err.status(), MountStatus::failed(errno::ENOENT, MountStep::FindPartition));
    }

    #[test]
    fn test_command_failed_includes_command_and_message() {
        let err = Error::command_failed("vm-attach", "exit status 3");
        let msg = err.to_string();
        assert!(msg.contains("vm-attach"), "Error should include command name");
        assert!(msg.contains("exit status 3"));
    }
}
