//! HTTP client of a running `vmdisk serve`.
//!
//! Error responses are turned back into [`Error`] values, so a stage
//! failure reported by the service carries the same `{result, step}` pair
//! as one raised in-process.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use vmdisk_protocol::MountStep;

use crate::api::error::ErrorBody;
use crate::api::types::{
    AttachRequest, AttachResponse, HealthResponse, ListDisksResponse, MountRequest, MountResponse,
    UnmountRequest,
};
use crate::error::{Error, Result};
use crate::manager::DiskStatus;
use crate::mount::MountFailure;

/// Above the server's own request timeout, so the server reports first.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(310);

/// Health checks must fail fast while the service is starting.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Client of the disk API.
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Client of the service listening on `addr`.
    pub fn new(addr: SocketAddr) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Service(format!("build http client: {}", e)))?;
        Ok(Self {
            base: format!("http://{}", addr),
            http,
        })
    }

    /// Check that the service answers.
    pub async fn health(&self) -> Result<HealthResponse> {
        let resp = self
            .http
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        decode(resp, None).await
    }

    /// List persisted and attached disks.
    pub async fn list(&self) -> Result<Vec<DiskStatus>> {
        let resp = self
            .http
            .get(self.url("/api/v1/disks"))
            .send()
            .await
            .map_err(transport)?;
        decode::<ListDisksResponse>(resp, None)
            .await
            .map(|r| r.disks)
    }

    /// Attach a disk without mounting it.
    pub async fn attach(&self, req: &AttachRequest) -> Result<AttachResponse> {
        self.post("/api/v1/disks/attach", req, Some(req.disk.as_str())).await
    }

    /// Mount one partition.
    pub async fn mount(&self, req: &MountRequest) -> Result<MountResponse> {
        self.post("/api/v1/disks/mount", req, Some(req.disk.as_str())).await
    }

    /// Unmount one disk, or every disk when `req.disk` is absent.
    pub async fn unmount(&self, req: &UnmountRequest) -> Result<()> {
        self.post::<_, serde_json::Value>("/api/v1/disks/unmount", req, req.disk.as_deref())
            .await
            .map(|_| ())
    }

    /// Forget and release everything.
    pub async fn shutdown(&self) -> Result<()> {
        self.post::<_, serde_json::Value>("/api/v1/shutdown", &serde_json::json!({}), None)
            .await
            .map(|_| ())
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        disk: Option<&str>,
    ) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(resp, disk).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn transport(e: reqwest::Error) -> Error {
    if e.is_connect() {
        Error::ServiceUnavailable(e.to_string())
    } else {
        Error::Service(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response, disk: Option<&str>) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| Error::Service(format!("decode response: {}", e)));
    }

    let body: ErrorBody = resp
        .json()
        .await
        .map_err(|e| Error::Service(format!("{} with unreadable body: {}", status, e)))?;
    Err(error_from_body(status, body, disk))
}

/// Rebuild the error the service reported.
fn error_from_body(status: StatusCode, body: ErrorBody, disk: Option<&str>) -> Error {
    if let (Some(result), Some(step)) = (body.result, body.step) {
        if let Ok(step) = MountStep::try_from(step) {
            let failure = MountFailure::new(result, step);
            return match step {
                MountStep::Unmount | MountStep::RemoveMountpoint | MountStep::Detach => {
                    Error::UnmountFailed(failure)
                }
                _ => Error::MountFailed(failure),
            };
        }
    }

    let path = PathBuf::from(disk.unwrap_or_default());
    match status {
        StatusCode::NOT_FOUND => Error::DiskNotFound { path },
        StatusCode::CONFLICT => Error::DiskInUse {
            path,
            reason: body.error,
        },
        _ => Error::Service(body.error),
    }
}
