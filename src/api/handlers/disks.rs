//! Disk handlers.
//!
//! Manager calls block on the VM and the guest, so each one runs on the
//! blocking pool.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{
    AttachRequest, AttachResponse, ListDisksResponse, MountRequest, MountResponse, UnmountRequest,
};

/// GET /api/v1/disks - List persisted and attached disks.
#[utoipa::path(
    get,
    path = "/api/v1/disks",
    tag = "disks",
    responses((status = 200, description = "Disks", body = ListDisksResponse))
)]
pub async fn list_disks(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ListDisksResponse>, ApiError> {
    let manager = state.manager.clone();
    let disks = tokio::task::spawn_blocking(move || manager.list()).await??;
    Ok(Json(ListDisksResponse { disks }))
}

/// POST /api/v1/disks/attach - Attach a disk without mounting it.
#[utoipa::path(
    post,
    path = "/api/v1/disks/attach",
    tag = "disks",
    request_body = AttachRequest,
    responses(
        (status = 200, description = "Disk attached", body = AttachResponse),
        (status = 404, description = "Disk not found"),
        (status = 409, description = "Disk in use")
    )
)]
pub async fn attach_disk(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AttachRequest>,
) -> Result<Json<AttachResponse>, ApiError> {
    if req.disk.is_empty() {
        return Err(ApiError::BadRequest("disk cannot be empty".into()));
    }

    let manager = state.manager.clone();
    let handle = tokio::task::spawn_blocking(move || manager.attach(&req.disk, req.kind)).await??;

    Ok(Json(AttachResponse {
        disk: handle.id.to_string(),
        lun: handle.lun,
        device: handle.guest_device,
    }))
}

/// POST /api/v1/disks/mount - Mount one partition, attaching the disk first.
#[utoipa::path(
    post,
    path = "/api/v1/disks/mount",
    tag = "disks",
    request_body = MountRequest,
    responses(
        (status = 200, description = "Partition mounted", body = MountResponse),
        (status = 404, description = "Disk not found"),
        (status = 409, description = "Disk in use or mount name taken"),
        (status = 422, description = "A mount stage failed; body carries result and step")
    )
)]
pub async fn mount_disk(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<MountRequest>,
) -> Result<Json<MountResponse>, ApiError> {
    if req.disk.is_empty() {
        return Err(ApiError::BadRequest("disk cannot be empty".into()));
    }

    let manager = state.manager.clone();
    let info = tokio::task::spawn_blocking(move || {
        let record = req.record();
        manager.mount(&req.disk, req.kind, record)
    })
    .await??;

    Ok(Json(MountResponse::mounted(info.path, info.filesystem)))
}

/// POST /api/v1/disks/unmount - Unmount one disk, or all of them.
#[utoipa::path(
    post,
    path = "/api/v1/disks/unmount",
    tag = "disks",
    request_body = UnmountRequest,
    responses(
        (status = 200, description = "Disk unmounted"),
        (status = 422, description = "An unmount stage failed")
    )
)]
pub async fn unmount_disk(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<UnmountRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let manager = state.manager.clone();
    tokio::task::spawn_blocking(move || match &req.disk {
        Some(disk) => manager.unmount(disk),
        None => manager.unmount_all(),
    })
    .await??;

    Ok(Json(serde_json::json!({ "result": 0 })))
}

/// POST /api/v1/shutdown - Delete all persisted state, detach everything
/// and stop the VM.
#[utoipa::path(
    post,
    path = "/api/v1/shutdown",
    tag = "disks",
    responses((status = 200, description = "Everything released"))
)]
pub async fn shutdown(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let manager = state.manager.clone();
    tokio::task::spawn_blocking(move || manager.shutdown_sweep()).await??;
    Ok(Json(serde_json::json!({ "result": 0 })))
}
