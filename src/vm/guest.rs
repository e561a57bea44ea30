//! Guest-side staged primitives.
//!
//! Every call is blocking and reports failure as a positive errno plus a
//! message. The mount pipeline turns these into stage-coded failures.

use vmdisk_protocol::errno;

/// Failure of a guest primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestError {
    /// Positive errno.
    pub errno: i32,
    /// What went wrong.
    pub message: String,
}

/// Result type for guest primitives.
pub type GuestResult<T> = std::result::Result<T, GuestError>;

impl GuestError {
    /// Create a guest error.
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno: errno.abs(),
            message: message.into(),
        }
    }

    /// The guest could not be reached or answered nonsense.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(errno::EIO, message)
    }
}

impl std::fmt::Display for GuestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, errno::name(self.errno))
    }
}

impl std::error::Error for GuestError {}

/// Block device and mount primitives executed inside the guest.
pub trait Guest: Send + Sync {
    /// Guest device node for the disk attached at `lun`.
    fn resolve_device(&self, lun: u32) -> GuestResult<String>;

    /// Check that a device node is usable.
    fn probe_device(&self, device: &str) -> GuestResult<()>;

    /// Device node of partition `index` (1-based) of `device`.
    fn find_partition(&self, device: &str, index: u32) -> GuestResult<String>;

    /// Filesystem type found on `device`. EINVAL when none is recognized.
    fn detect_filesystem(&self, device: &str) -> GuestResult<String>;

    /// Create a mountpoint directory. An existing empty directory is fine.
    fn create_mountpoint(&self, path: &str) -> GuestResult<()>;

    /// Mount `source` at `target`.
    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        options: Option<&str>,
    ) -> GuestResult<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &str) -> GuestResult<()>;

    /// Remove a mountpoint directory. A missing directory is fine.
    fn remove_mountpoint(&self, path: &str) -> GuestResult<()>;

    /// Flush and drop the device at `lun` ahead of hot-removal.
    fn release_device(&self, lun: u32) -> GuestResult<()>;
}
