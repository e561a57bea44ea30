//! Agent error type carrying the errno reported back to the host.

use vmdisk_protocol::{errno, AgentResponse};

/// Failure of a guest primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentError {
    /// Positive errno.
    pub errno: i32,
    /// What failed.
    pub message: String,
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Create an error with an explicit errno.
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno: errno.abs(),
            message: message.into(),
        }
    }

    /// Wrap an I/O error with context, keeping its errno.
    pub fn io(context: impl std::fmt::Display, e: &std::io::Error) -> Self {
        Self::new(
            e.raw_os_error().unwrap_or(errno::EIO),
            format!("{}: {}", context, e),
        )
    }

    /// Whether this failure may clear up once hotplug settles.
    pub fn is_transient(&self) -> bool {
        self.errno == errno::ENOENT || self.errno == errno::ENXIO
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, errno::name(self.errno))
    }
}

impl std::error::Error for AgentError {}

#[cfg(target_os = "linux")]
impl From<nix::Error> for AgentError {
    fn from(e: nix::Error) -> Self {
        AgentError::new(e as i32, e.desc())
    }
}

impl From<AgentError> for AgentResponse {
    fn from(e: AgentError) -> Self {
        AgentResponse::error(e.errno, e.message)
    }
}
