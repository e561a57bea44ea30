//! API server state.

use crate::manager::DiskMountManager;
use std::sync::Arc;
use std::time::Duration;

/// Shared API server state.
pub struct ApiState {
    /// The disk mount manager.
    pub manager: Arc<DiskMountManager>,
    /// Inactivity after which the supervisor releases the VM.
    pub idle_timeout: Duration,
}

impl ApiState {
    /// Create API state around `manager`.
    pub fn new(manager: Arc<DiskMountManager>, idle_timeout: Duration) -> Self {
        Self {
            manager,
            idle_timeout,
        }
    }
}
