//! Idle supervisor.
//!
//! Releases the utility VM once the manager has been idle for the
//! configured timeout. Persisted disks survive and are replayed the next
//! time a call needs the VM.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::state::ApiState;

/// How often the supervisor checks for idleness.
const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task releasing an idle VM.
pub struct Supervisor {
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a supervisor that stops when `shutdown_rx` turns true.
    pub fn new(state: Arc<ApiState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { state, shutdown_rx }
    }

    /// Run until shutdown.
    pub async fn run(mut self) {
        let period = CHECK_INTERVAL.min(self.state.idle_timeout.max(Duration::from_secs(1)));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => self.check().await,
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::debug!("supervisor stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn check(&self) {
        let manager = self.state.manager.clone();
        let timeout = self.state.idle_timeout;
        match tokio::task::spawn_blocking(move || manager.release_if_idle(timeout)).await {
            Ok(true) => tracing::info!(idle_timeout = ?timeout, "released idle vm"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "idle check failed"),
        }
    }
}
