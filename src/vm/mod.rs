//! Utility VM runtime seam.
//!
//! This module provides the abstractions the disk manager drives:
//! - [`VmBackend`]: starts utility VM instances
//! - [`VmInstance`]: a running VM that disks can be hot-added to
//! - [`Guest`]: block device and mount primitives inside the VM

pub mod backend;
pub mod guest;
pub mod state;

use crate::disk::{DiskId, DiskKind};
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use guest::{Guest, GuestError, GuestResult};
pub use state::VmState;

/// A running utility VM.
///
/// Each instance carries a generation number that is unique within the
/// process. Disk handles remember the generation they were created under so
/// a handle from a torn-down VM is never mistaken for a live one.
pub trait VmInstance: Send + Sync {
    /// Generation of this instance.
    fn generation(&self) -> u64;

    /// Current state.
    fn state(&self) -> VmState;

    /// Hot-add a host disk to the VM's SCSI controller. Returns the LUN.
    fn hot_add_disk(&self, disk: &DiskId, kind: DiskKind) -> Result<u32>;

    /// Hot-remove the disk at `lun`.
    fn hot_remove_disk(&self, lun: u32) -> Result<()>;

    /// Guest primitives of this VM.
    fn guest(&self) -> &dyn Guest;

    /// Stop the VM.
    fn stop(&self) -> Result<()>;
}

/// Factory for utility VMs.
pub trait VmBackend: Send + Sync {
    /// Backend name (e.g., "external", "simulated").
    fn name(&self) -> &'static str;

    /// Check if this backend can start VMs on the current system.
    fn is_available(&self) -> bool;

    /// Start a VM and wait until its guest agent answers.
    fn start(&self) -> Result<Arc<dyn VmInstance>>;
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh instance generation.
pub fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_are_unique() {
        let a = next_generation();
        let b = next_generation();
        assert!(b > a);
    }
}
