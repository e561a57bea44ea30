//! HTTP API server for vmdisk.
//!
//! This module exposes the disk mount manager over HTTP so other processes
//! can attach and mount disks without going through the CLI.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! vmdisk serve --listen 127.0.0.1:7420
//!
//! # Mount partition 1 of a disk image
//! curl -X POST http://localhost:7420/api/v1/disks/mount \
//!   -H "Content-Type: application/json" \
//!   -d '{"disk": "/srv/images/data.vhdx", "partition": 1}'
//! ```

pub mod client;
pub mod error;
pub mod handlers;
pub mod state;
pub mod supervisor;
pub mod types;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;

use state::ApiState;

/// Mounts can wait on filesystem detection and the VM boot.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// OpenAPI document of the HTTP API.
#[derive(OpenApi)]
#[openapi(
    info(title = "vmdisk", description = "Disk mount manager API"),
    paths(
        handlers::health::health,
        handlers::disks::list_disks,
        handlers::disks::attach_disk,
        handlers::disks::mount_disk,
        handlers::disks::unmount_disk,
        handlers::disks::shutdown,
    ),
    components(schemas(
        types::AttachRequest,
        types::AttachResponse,
        types::MountRequest,
        types::MountResponse,
        types::UnmountRequest,
        types::ListDisksResponse,
        types::HealthResponse,
        crate::manager::DiskStatus,
        crate::manager::PartitionStatus,
        crate::disk::DiskKind,
        crate::disk::MountRecord,
        crate::disk::MountInfo,
    )),
    tags(
        (name = "health", description = "Server health"),
        (name = "disks", description = "Disk attach, mount and unmount")
    )
)]
pub struct ApiDoc;

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    let health_route = Router::new().route("/health", get(handlers::health::health));

    let disk_routes = Router::new()
        .route("/", get(handlers::disks::list_disks))
        .route("/attach", post(handlers::disks::attach_disk))
        .route("/mount", post(handlers::disks::mount_disk))
        .route("/unmount", post(handlers::disks::unmount_disk));

    let api_v1 = Router::new()
        .nest("/disks", disk_routes)
        .route("/shutdown", post(handlers::disks::shutdown))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    // CORS: localhost origins only.
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:7420"),
            HeaderValue::from_static("http://127.0.0.1:7420"),
        ])
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
