//! HTTP API server command.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use vmdisk::api::state::ApiState;
use vmdisk::config::VmdiskConfig;
use vmdisk::{DiskMountManager, Error, Result};

use super::parsers::parse_duration;

/// Start the HTTP API server.
#[derive(Parser, Debug)]
#[command(about = "Start the HTTP API server that owns the utility VM")]
#[command(after_long_help = "\
The server keeps the VM while disks are in use and releases it after the
idle timeout. Released disks are attached and mounted again on the next
request.

API ENDPOINTS:
  GET    /health                     Health check
  GET    /api/v1/disks               List disks
  POST   /api/v1/disks/attach        Attach a disk
  POST   /api/v1/disks/mount         Mount a partition
  POST   /api/v1/disks/unmount       Unmount a disk (or all disks)
  POST   /api/v1/shutdown            Forget and release everything

EXAMPLES:
  vmdisk serve                       Listen on the configured address
  vmdisk serve -l 127.0.0.1:9000     Listen on port 9000
  vmdisk serve --idle-timeout 5m     Keep an idle VM for five minutes")]
pub struct ServeCmd {
    /// Address and port to listen on (defaults to the configured address)
    #[arg(short, long, value_name = "ADDR:PORT")]
    listen: Option<SocketAddr>,

    /// Release the VM after this long without requests
    #[arg(long, value_parser = parse_duration, value_name = "DURATION")]
    idle_timeout: Option<Duration>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self, config: &VmdiskConfig) -> Result<()> {
        let addr = self.listen.unwrap_or(config.listen);
        let idle_timeout = self.idle_timeout.unwrap_or_else(|| config.idle_timeout());
        let manager = Arc::new(DiskMountManager::from_config(config)?);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Io)?;

        runtime.block_on(run_server(manager, addr, idle_timeout))
    }
}

async fn run_server(
    manager: Arc<DiskMountManager>,
    addr: SocketAddr,
    idle_timeout: Duration,
) -> Result<()> {
    if addr.ip().is_unspecified() {
        eprintln!(
            "WARNING: Server is listening on all interfaces ({}).",
            addr.ip()
        );
        eprintln!("         The API has no authentication - any network client can mount disks.");
    }

    let state = Arc::new(ApiState::new(manager.clone(), idle_timeout));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor_state = state.clone();
    let supervisor_handle = tokio::spawn(async move {
        vmdisk::api::supervisor::Supervisor::new(supervisor_state, shutdown_rx)
            .run()
            .await;
    });

    let app = vmdisk::api::create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::Io)?;

    tracing::info!(address = %addr, idle_timeout = ?idle_timeout, "starting HTTP API server");
    println!("vmdisk API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), supervisor_handle).await;

    // Same as an idle teardown: persisted disks come back next time.
    let released = tokio::task::spawn_blocking(move || manager.release_vm()).await;
    if let Ok(true) = released {
        tracing::info!("released vm on server shutdown");
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    eprintln!("\nShutting down server (persisted disks are kept)...");
}
