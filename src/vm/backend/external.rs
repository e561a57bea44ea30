//! VM backend driving an external runtime through configured commands.

use crate::agent::AgentClient;
use crate::config::VmRuntimeConfig;
use crate::disk::{DiskId, DiskKind};
use crate::error::{Error, Result};
use crate::vm::{next_generation, Guest, VmBackend, VmInstance, VmState};
use parking_lot::Mutex;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Backend that starts and controls the VM with external commands.
pub struct ExternalBackend {
    config: VmRuntimeConfig,
}

impl ExternalBackend {
    /// Create a backend from runtime configuration.
    pub fn new(config: VmRuntimeConfig) -> Self {
        Self { config }
    }
}

impl VmBackend for ExternalBackend {
    fn name(&self) -> &'static str {
        "external"
    }

    fn is_available(&self) -> bool {
        !self.config.start_command.is_empty()
            && !self.config.attach_command.is_empty()
            && !self.config.detach_command.is_empty()
    }

    fn start(&self) -> Result<Arc<dyn VmInstance>> {
        if !self.is_available() {
            return Err(Error::UnsupportedHostConfiguration(
                "vm runtime commands are not configured".into(),
            ));
        }

        run_command(&self.config.start_command, &[])?;
        let client =
            AgentClient::connect_with_retry(&self.config.agent_socket, self.config.connect_timeout())?;
        let version = client.ping()?;

        let vm = ExternalVm {
            generation: next_generation(),
            config: self.config.clone(),
            client,
            state: Mutex::new(VmState::Running),
        };
        info!(generation = vm.generation, agent_version = version, "utility vm started");
        Ok(Arc::new(vm))
    }
}

/// A VM controlled by external commands.
struct ExternalVm {
    generation: u64,
    config: VmRuntimeConfig,
    client: AgentClient,
    state: Mutex<VmState>,
}

impl VmInstance for ExternalVm {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn state(&self) -> VmState {
        let state = self.state.lock().clone();
        if state.is_running() {
            if let Err(e) = self.client.ping() {
                let failed = VmState::Failed {
                    reason: e.to_string(),
                };
                *self.state.lock() = failed.clone();
                return failed;
            }
        }
        state
    }

    fn hot_add_disk(&self, disk: &DiskId, kind: DiskKind) -> Result<u32> {
        let disk_arg = disk.key();
        let out = run_command(
            &self.config.attach_command,
            &[("{disk}", disk_arg.as_str()), ("{kind}", kind.as_str())],
        )?;
        out.trim().parse::<u32>().map_err(|_| {
            Error::command_failed(
                self.config.attach_command.join(" "),
                format!("expected a LUN on stdout, got {:?}", out.trim()),
            )
        })
    }

    fn hot_remove_disk(&self, lun: u32) -> Result<()> {
        let lun = lun.to_string();
        run_command(&self.config.detach_command, &[("{lun}", lun.as_str())]).map(|_| ())
    }

    fn guest(&self) -> &dyn Guest {
        &self.client
    }

    fn stop(&self) -> Result<()> {
        if let Err(e) = self.client.shutdown() {
            debug!(error = %e, "agent shutdown failed");
        }
        *self.state.lock() = VmState::Stopped;
        if self.config.stop_command.is_empty() {
            return Ok(());
        }
        run_command(&self.config.stop_command, &[]).map(|_| ())
    }
}

/// Run `argv` with placeholders substituted. Returns stdout.
fn run_command(argv: &[String], vars: &[(&str, &str)]) -> Result<String> {
    let args: Vec<String> = argv
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect();

    let Some((program, rest)) = args.split_first() else {
        return Err(Error::Config("empty vm runtime command".into()));
    };

    debug!(command = ?args, "running vm runtime command");
    let output = Command::new(program)
        .args(rest)
        .output()
        .map_err(|e| Error::command_failed(program.clone(), e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(command = ?args, status = ?output.status.code(), "vm runtime command failed");
        return Err(Error::command_failed(args.join(" "), stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
