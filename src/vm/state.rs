//! Utility VM lifecycle state.

use std::fmt;

/// Lifecycle of one VM instance. An instance never leaves a terminal state;
/// the manager starts a new one instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    /// Guest agent answers; disks can be hot-added.
    Running,

    /// Stopped by the manager (idle teardown or shutdown).
    Stopped,

    /// Went away without being asked to.
    Failed {
        /// What was observed.
        reason: String,
    },
}

impl VmState {
    /// Whether the instance is gone for good.
    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    /// Whether disks can be attached to the VM.
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Running => f.write_str("running"),
            VmState::Stopped => f.write_str("stopped"),
            VmState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_accepts_disks() {
        assert!(VmState::Running.is_running());
        assert!(!VmState::Stopped.is_running());
        assert!(VmState::Failed {
            reason: "gone".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_failed_state_shows_reason() {
        let failed = VmState::Failed {
            reason: "agent stopped answering".into(),
        };
        assert_eq!(failed.to_string(), "failed: agent stopped answering");
        assert_eq!(VmState::Stopped.to_string(), "stopped");
    }
}
