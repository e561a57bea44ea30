//! The HTTP client against a live service backed by the simulated VM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vmdisk::api::client::ApiClient;
use vmdisk::api::state::ApiState;
use vmdisk::api::types::{AttachRequest, MountRequest, UnmountRequest};
use vmdisk::simulated::{DiskCatalog, SimDisk, SimulatedBackend, SimulatedHost};
use vmdisk::store::StateStore;
use vmdisk::vm::VmBackend;
use vmdisk::{DiskKind, DiskMountManager, Error, MountStatus, MountStep};

struct Service {
    _dir: TempDir,
    catalog: DiskCatalog,
    backend: Arc<SimulatedBackend>,
    client: ApiClient,
}

async fn start_service() -> Service {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state.redb")).unwrap();
    let catalog = DiskCatalog::new();
    let backend = Arc::new(SimulatedBackend::new(catalog.clone()));
    let manager = DiskMountManager::new(
        store,
        Arc::new(SimulatedHost::new(catalog.clone())),
        Some(backend.clone() as Arc<dyn VmBackend>),
        "/mnt/vmdisk",
    );
    let state = Arc::new(ApiState::new(Arc::new(manager), Duration::from_secs(60)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, vmdisk::api::create_router(state))
            .await
            .unwrap();
    });

    Service {
        _dir: dir,
        catalog,
        backend,
        client: ApiClient::new(addr).unwrap(),
    }
}

fn mount_request(disk: &str, partition: u32, filesystem: Option<&str>) -> MountRequest {
    MountRequest {
        disk: disk.to_string(),
        kind: DiskKind::Virtual,
        partition,
        filesystem: filesystem.map(str::to_string),
        options: None,
        name: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mount_outlives_the_request_that_made_it() {
    let svc = start_service().await;
    svc.catalog.insert("/img/data.vhdx", SimDisk::virtual_disk().with_partitions(&["ext4"]));

    let health = svc.client.health().await.unwrap();
    assert!(!health.vm_running);

    let mounted = svc
        .client
        .mount(&mount_request("/img/data.vhdx", 1, None))
        .await
        .unwrap();
    assert_eq!(mounted.result, 0);
    assert_eq!(mounted.filesystem, "ext4");

    // A later request, like a later CLI invocation, still sees the mount.
    let disks = svc.client.list().await.unwrap();
    assert_eq!(disks.len(), 1);
    assert!(disks[0].attached);
    let partition = &disks[0].partitions[0];
    assert_eq!(partition.mounted.as_ref().unwrap().path, mounted.path);
    assert!(svc.client.health().await.unwrap().vm_running);
    assert_eq!(svc.backend.start_count(), 1);

    svc.client
        .unmount(&UnmountRequest {
            disk: Some("/img/data.vhdx".into()),
        })
        .await
        .unwrap();
    assert!(svc.client.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stage_failures_keep_their_result_and_step() {
    let svc = start_service().await;
    svc.catalog.insert("/img/a.vhdx", SimDisk::virtual_disk().with_partitions(&["ext4"]));
    svc.catalog.insert("/img/b.vhdx", SimDisk::virtual_disk().with_partitions(&["ext4"]));

    let err = svc
        .client
        .mount(&mount_request("/img/a.vhdx", 1, Some("vfat")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MountFailed(_)));
    assert_eq!(err.status(), MountStatus::failed(22, MountStep::Mount));

    let mut named = mount_request("/img/a.vhdx", 1, None);
    named.name = Some("data".into());
    svc.client.mount(&named).await.unwrap();

    let mut clash = mount_request("/img/b.vhdx", 1, None);
    clash.name = Some("data".into());
    let err = svc.client.mount(&clash).await.unwrap_err();
    assert_eq!(err.status(), MountStatus::failed(17, MountStep::ResolveMountpoint));
}

#[tokio::test(flavor = "multi_thread")]
async fn host_errors_come_back_typed() {
    let svc = start_service().await;

    let err = svc
        .client
        .attach(&AttachRequest {
            disk: "/img/missing.vhdx".into(),
            kind: DiskKind::Virtual,
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    svc.client.shutdown().await.unwrap();
    assert!(svc.client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn nothing_listening_is_service_unavailable() {
    // Bind and drop to find a port nobody listens on.
    let addr: SocketAddr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let err = ApiClient::new(addr).unwrap().health().await.unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable(_)), "unexpected error: {err}");
}
