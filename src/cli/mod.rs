//! CLI command implementations.
//!
//! Commands that need the VM talk to `vmdisk serve`, which owns the VM and
//! the state database. A service is started in the background when none
//! answers. Commands that never start the VM fall back to running in-process
//! when no service is up.

pub mod attach;
pub mod config;
pub mod list;
pub mod mount;
pub mod openapi;
pub mod parsers;
pub mod serve;
pub mod shutdown;
pub mod unmount;

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use vmdisk::api::client::ApiClient;
use vmdisk::config::VmdiskConfig;
use vmdisk::{DiskMountManager, Error, Result};

/// How long a freshly started service gets to answer.
const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the service.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Loaded configuration and where it came from.
pub struct Context {
    /// Effective configuration.
    pub config: VmdiskConfig,
    /// `--config` as given on the command line.
    pub config_path: Option<PathBuf>,
}

impl Context {
    /// Config file this invocation reads.
    pub fn config_file(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => VmdiskConfig::default_path(),
        }
    }
}

/// Runtime for one CLI request.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)
}

/// Client of the service, starting one if none answers.
pub async fn service(ctx: &Context) -> Result<ApiClient> {
    if let Some(client) = running_service(ctx).await? {
        return Ok(client);
    }

    spawn_service(ctx)?;
    let client = ApiClient::new(ctx.config.listen)?;
    wait_for_ready(&client, ctx).await?;
    Ok(client)
}

/// Client of the service if one answers.
pub async fn running_service(ctx: &Context) -> Result<Option<ApiClient>> {
    let client = ApiClient::new(ctx.config.listen)?;
    match client.health().await {
        Ok(_) => Ok(Some(client)),
        Err(Error::ServiceUnavailable(e)) => {
            tracing::debug!(address = %ctx.config.listen, error = %e, "no service running");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Run `f` against an in-process manager. Only for calls that never start
/// the VM, and only while no service holds the state database.
pub fn with_manager<T>(
    config: &VmdiskConfig,
    f: impl FnOnce(&DiskMountManager) -> Result<T>,
) -> Result<T> {
    let manager = DiskMountManager::from_config(config)?;
    f(&manager)
}

/// Absolute form of a disk argument. The service resolves relative paths
/// against its own working directory, not ours.
pub fn disk_arg(path: &Path) -> Result<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(absolute.to_string_lossy().into_owned())
}

/// Start `vmdisk serve` detached from this process and its terminal.
/// The service outlives us and is never waited on.
#[allow(clippy::zombie_processes)]
fn spawn_service(ctx: &Context) -> Result<()> {
    let exe = std::env::current_exe()?;
    let log_path = service_log_path(&ctx.config);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

    let mut cmd = Command::new(exe);
    if let Some(path) = &ctx.config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.arg("serve")
        .arg("--listen")
        .arg(ctx.config.listen.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log)
        .process_group(0);

    let child = cmd.spawn()?;
    tracing::info!(pid = child.id(), log = %log_path.display(), "started vmdisk service");
    Ok(())
}

async fn wait_for_ready(client: &ApiClient, ctx: &Context) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < SERVICE_START_TIMEOUT {
        match client.health().await {
            Ok(_) => return Ok(()),
            Err(e) => tracing::trace!(error = %e, "service not ready"),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Err(Error::ServiceUnavailable(format!(
        "service on {} did not answer within {} seconds (see {})",
        ctx.config.listen,
        SERVICE_START_TIMEOUT.as_secs(),
        service_log_path(&ctx.config).display()
    )))
}

/// Background service log, next to the state database.
fn service_log_path(config: &VmdiskConfig) -> PathBuf {
    config.state_path.with_file_name("serve.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_arg_is_absolute() {
        assert_eq!(disk_arg(Path::new("/dev/sdb")).unwrap(), "/dev/sdb");

        let relative = disk_arg(Path::new("images/data.vhdx")).unwrap();
        assert!(Path::new(&relative).is_absolute());
        assert!(relative.ends_with("images/data.vhdx"));
    }

    #[test]
    fn test_service_log_sits_next_to_state() {
        let config = VmdiskConfig {
            state_path: PathBuf::from("/run/user/1000/vmdisk/state.redb"),
            ..VmdiskConfig::default()
        };
        assert_eq!(
            service_log_path(&config),
            PathBuf::from("/run/user/1000/vmdisk/serve.log")
        );
    }
}
