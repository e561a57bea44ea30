//! Global vmdisk configuration.
//!
//! Stored as TOML at `<config dir>/vmdisk/config.toml`. A missing file yields
//! the defaults and missing fields take their per-field defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and state directories.
const APP_NAME: &str = "vmdisk";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Global vmdisk configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmdiskConfig {
    /// Configuration format version.
    pub version: u8,

    /// Guest directory mounts are created under.
    pub mount_root: String,

    /// State database location. Defaults to the runtime directory, which
    /// the host clears at reboot.
    pub state_path: PathBuf,

    /// Seconds without activity before the service releases the VM.
    pub idle_timeout_secs: u64,

    /// Address the HTTP service listens on.
    pub listen: SocketAddr,

    /// External VM runtime. Without it no VM can be started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmRuntimeConfig>,
}

impl Default for VmdiskConfig {
    fn default() -> Self {
        Self {
            version: 1,
            mount_root: "/mnt/vmdisk".to_string(),
            state_path: default_state_path(),
            idle_timeout_secs: 60,
            listen: SocketAddr::from(([127, 0, 0, 1], 7420)),
            vm: None,
        }
    }
}

/// Commands and sockets of an external VM runtime.
///
/// Command arguments may contain `{disk}`, `{kind}` and `{lun}`
/// placeholders, substituted per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRuntimeConfig {
    /// Host Unix socket proxied to the guest agent's vsock port.
    pub agent_socket: PathBuf,

    /// Starts the VM.
    pub start_command: Vec<String>,

    /// Stops the VM.
    #[serde(default)]
    pub stop_command: Vec<String>,

    /// Hot-adds `{disk}` of `{kind}`; prints the assigned LUN on stdout.
    pub attach_command: Vec<String>,

    /// Hot-removes the disk at `{lun}`.
    pub detach_command: Vec<String>,

    /// How long to wait for the guest agent after start.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

impl VmRuntimeConfig {
    /// Agent connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl VmdiskConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join(APP_NAME).join(CONFIG_FILE))
            .ok_or_else(|| Error::Config("no config directory for this user".into()))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        };
        toml::from_str(&text).map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::ConfigSave(e.to_string()))?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// `<runtime dir>/vmdisk/state.redb`, falling back to the temp dir.
fn default_state_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join("state.redb")
}
