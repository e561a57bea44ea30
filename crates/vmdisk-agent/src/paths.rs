//! Path constants and retry tuning for the vmdisk agent.

// =============================================================================
// sysfs
// =============================================================================

/// SCSI devices, named `host:channel:target:lun`.
pub const SCSI_DEVICES_DIR: &str = "/sys/bus/scsi/devices";

/// Block devices and their partitions.
pub const BLOCK_CLASS_DIR: &str = "/sys/class/block";

/// Device node directory.
pub const DEV_DIR: &str = "/dev";

// =============================================================================
// Binaries
// =============================================================================

/// blkid binary used for filesystem detection.
pub const BLKID_PATH: &str = "blkid";

// =============================================================================
// Hotplug retries
// =============================================================================

/// How many times to look for a hot-added device before giving up.
/// The kernel creates the block device asynchronously after the host adds it.
pub const DEVICE_RETRY_COUNT: u32 = 50;

/// Delay between device lookups (milliseconds).
pub const DEVICE_RETRY_DELAY_MS: u64 = 100;
