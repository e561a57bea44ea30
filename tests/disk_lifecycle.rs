//! End-to-end disk lifecycle against the simulated host and VM.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use vmdisk::disk::{DiskId, DiskKind, MountRecord};
use vmdisk::simulated::{DiskCatalog, SimDisk, SimulatedBackend, SimulatedHost};
use vmdisk::store::StateStore;
use vmdisk::vm::VmBackend;
use vmdisk::{DiskMountManager, Error, MountStatus, MountStep};

const ROOT: &str = "/mnt/vmdisk";

struct Harness {
    _dir: TempDir,
    catalog: DiskCatalog,
    backend: Arc<SimulatedBackend>,
    manager: DiskMountManager,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.redb")).unwrap();
        let catalog = DiskCatalog::new();
        let backend = Arc::new(SimulatedBackend::new(catalog.clone()));
        let manager = DiskMountManager::new(
            store,
            Arc::new(SimulatedHost::new(catalog.clone())),
            Some(backend.clone() as Arc<dyn VmBackend>),
            ROOT,
        );
        Self {
            _dir: dir,
            catalog,
            backend,
            manager,
        }
    }

    fn guest_mounts(&self) -> Vec<(String, String)> {
        self.backend
            .current()
            .map(|vm| vm.mounts())
            .unwrap_or_default()
    }
}

fn record(partition: u32, filesystem: Option<&str>, name: Option<&str>) -> MountRecord {
    MountRecord {
        partition,
        filesystem: filesystem.map(str::to_string),
        options: None,
        name: name.map(str::to_string),
    }
}

/// Relative spelling of an absolute path, without changing the working
/// directory.
fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut rel = PathBuf::new();
    for _ in cwd.components().filter(|c| matches!(c, Component::Normal(_))) {
        rel.push("..");
    }
    rel.join(path.strip_prefix("/").unwrap())
}

#[test]
fn mount_unmount_mount_reproduces_the_same_mount() {
    let h = Harness::new();
    h.catalog.insert(
        "/dev/sdz",
        SimDisk::pass_through(false).with_partitions(&["ext4", "xfs"]),
    );

    let first = h
        .manager
        .mount("/dev/sdz", DiskKind::PassThrough, record(2, None, None))
        .unwrap();
    h.manager.unmount("/dev/sdz").unwrap();
    assert!(h.guest_mounts().is_empty());

    let second = h
        .manager
        .mount("/dev/sdz", DiskKind::PassThrough, record(2, None, None))
        .unwrap();
    assert_eq!(first.path, second.path);
    assert_eq!(first.filesystem, second.filesystem);
    assert_eq!(second.path, "/mnt/vmdisk/devsdzp2");
    assert_eq!(second.filesystem, "xfs");
}

#[test]
fn unmounting_an_unknown_disk_is_a_noop() {
    let h = Harness::new();
    h.manager.unmount("/dev/never-attached").unwrap();
    h.manager.unmount("/dev/never-attached").unwrap();
    assert_eq!(h.backend.start_count(), 0);
    assert!(h.manager.list().unwrap().is_empty());
}

#[test]
fn mount_name_collision_is_rejected() {
    let h = Harness::new();
    h.catalog.insert("/img/a.vhdx", SimDisk::virtual_disk().with_partitions(&["ext4"]));
    h.catalog.insert("/img/b.vhdx", SimDisk::virtual_disk().with_partitions(&["ext4", "vfat"]));

    let info = h
        .manager
        .mount("/img/a.vhdx", DiskKind::Virtual, record(1, None, Some("data")))
        .unwrap();
    assert_eq!(info.path, "/mnt/vmdisk/data");

    let err = h
        .manager
        .mount("/img/b.vhdx", DiskKind::Virtual, record(2, None, Some("data")))
        .unwrap_err();
    assert!(matches!(err, Error::MountFailed(_)));
    assert_eq!(err.status(), MountStatus::failed(17, MountStep::ResolveMountpoint));

    assert_eq!(
        h.guest_mounts(),
        vec![("/mnt/vmdisk/data".to_string(), "ext4".to_string())]
    );
    let b = h.manager.store().get_disk(&DiskId::from_stored("/img/b.vhdx")).unwrap().unwrap();
    assert!(b.mounts.is_empty());
}

#[test]
fn wrong_filesystem_fails_at_mount_and_keeps_the_disk_attached() {
    let h = Harness::new();
    h.catalog.insert("/dev/sdy", SimDisk::pass_through(true).with_partitions(&["ext4"]));

    let status = h.manager.mount_status(
        "/dev/sdy",
        DiskKind::PassThrough,
        record(1, Some("vfat"), None),
    );
    assert_eq!(status.result, -22);
    assert_eq!(status.step, MountStep::Mount);

    let list = h.manager.list().unwrap();
    assert_eq!(list.len(), 1);
    assert!(list[0].attached);
    assert!(list[0].partitions.is_empty());
    assert!(!h.backend.current().unwrap().has_directory("/mnt/vmdisk/devsdyp1"));

    // The same disk mounts fine with the right type.
    let info = h
        .manager
        .mount("/dev/sdy", DiskKind::PassThrough, record(1, Some("ext4"), None))
        .unwrap();
    assert_eq!(info.filesystem, "ext4");
}

#[test]
fn recovery_isolates_a_corrupted_mount_record() {
    let h = Harness::new();
    h.catalog.insert("/img/good.vhdx", SimDisk::virtual_disk().with_partitions(&["ext4"]));
    h.catalog.insert("/img/bad.vhdx", SimDisk::virtual_disk().with_partitions(&["ext4"]));

    let store = h.manager.store();
    let good = DiskId::from_stored("/img/good.vhdx");
    let bad = DiskId::from_stored("/img/bad.vhdx");
    store.upsert_disk(&good, DiskKind::Virtual).unwrap();
    store.upsert_mount(&good, &record(1, None, None)).unwrap();
    store.upsert_disk(&bad, DiskKind::Virtual).unwrap();
    store.upsert_mount(&bad, &record(1, Some("notafs"), None)).unwrap();

    h.manager.ensure_vm().unwrap();

    assert_eq!(
        h.guest_mounts(),
        vec![("/mnt/vmdisk/imggoodvhdxp1".to_string(), "ext4".to_string())]
    );
    let list = h.manager.list().unwrap();
    let bad_status = list.iter().find(|d| d.disk == "/img/bad.vhdx").unwrap();
    assert!(bad_status.attached);
    assert_eq!(bad_status.partitions.len(), 1);
    assert!(bad_status.partitions[0].mounted.is_none());
    assert_eq!(store.get_disk(&bad).unwrap().unwrap().mounts.len(), 1);
}

#[test]
fn pass_through_disks_get_their_online_state_back() {
    let h = Harness::new();
    h.catalog.insert("/dev/online", SimDisk::pass_through(true).with_filesystem("ext4"));
    h.catalog.insert("/dev/offline", SimDisk::pass_through(false).with_filesystem("ext4"));

    for (disk, before) in [("/dev/online", true), ("/dev/offline", false)] {
        h.manager.mount(disk, DiskKind::PassThrough, record(0, None, None)).unwrap();
        assert_eq!(h.catalog.is_online(disk), Some(false));
        h.manager.unmount(disk).unwrap();
        assert_eq!(h.catalog.is_online(disk), Some(before));
    }
}

#[test]
fn idle_teardown_keeps_mounts_and_shutdown_sweep_drops_them() {
    let h = Harness::new();
    h.catalog.insert("/dev/sdw", SimDisk::pass_through(true).with_partitions(&["ext4", "vfat"]));
    h.catalog.insert("/img/c.vhdx", SimDisk::virtual_disk().with_filesystem("xfs"));

    h.manager.mount("/dev/sdw", DiskKind::PassThrough, record(1, None, None)).unwrap();
    h.manager
        .mount("/dev/sdw", DiskKind::PassThrough, record(2, None, Some("boot")))
        .unwrap();
    h.manager.mount("/img/c.vhdx", DiskKind::Virtual, record(0, None, None)).unwrap();
    let before = h.guest_mounts();
    assert_eq!(before.len(), 3);

    assert!(h.manager.release_vm());
    assert!(!h.manager.is_vm_running());
    // The host gets the disk back while the VM is gone.
    assert_eq!(h.catalog.is_online("/dev/sdw"), Some(true));
    assert_eq!(h.manager.store().list_disks().unwrap().count(), 2);

    h.manager.ensure_vm().unwrap();
    assert_eq!(h.backend.start_count(), 2);
    assert_eq!(h.guest_mounts(), before);
    assert_eq!(h.catalog.is_online("/dev/sdw"), Some(false));

    h.manager.shutdown_sweep().unwrap();
    assert_eq!(h.manager.store().list_disks().unwrap().count(), 0);
    assert_eq!(h.catalog.is_online("/dev/sdw"), Some(true));

    h.manager.ensure_vm().unwrap();
    assert!(h.guest_mounts().is_empty());
}

#[test]
fn relative_and_absolute_paths_name_the_same_disk() {
    let h = Harness::new();
    let images = TempDir::new().unwrap();
    let file = images.path().join("disk.vhdx");
    std::fs::write(&file, b"").unwrap();
    let canonical = std::fs::canonicalize(&file).unwrap();
    h.catalog.insert(&canonical, SimDisk::virtual_disk().with_filesystem("ext4"));

    h.manager.mount(&file, DiskKind::Virtual, record(0, None, None)).unwrap();
    let id = DiskId::resolve(DiskKind::Virtual, &file).unwrap();
    assert!(h.manager.store().get_disk(&id).unwrap().is_some());

    h.manager.unmount(relative_to_cwd(&canonical)).unwrap();
    assert!(h.manager.store().get_disk(&id).unwrap().is_none());
    assert!(h.guest_mounts().is_empty());

    // And the other way round.
    h.manager
        .mount(relative_to_cwd(&canonical), DiskKind::Virtual, record(0, None, None))
        .unwrap();
    h.manager.unmount(&file).unwrap();
    assert!(h.manager.store().get_disk(&id).unwrap().is_none());
}

#[test]
fn different_disks_mount_in_parallel() {
    let h = Harness::new();
    let disks: Vec<String> = (0..6).map(|i| format!("/img/p{}.vhdx", i)).collect();
    for disk in &disks {
        h.catalog.insert(disk, SimDisk::virtual_disk().with_partitions(&["ext4"]));
    }

    std::thread::scope(|scope| {
        for disk in &disks {
            let manager = &h.manager;
            scope.spawn(move || {
                manager
                    .mount(disk, DiskKind::Virtual, record(1, None, None))
                    .unwrap();
            });
        }
    });

    assert_eq!(h.backend.start_count(), 1);
    assert_eq!(h.guest_mounts().len(), disks.len());
    h.manager.unmount_all().unwrap();
    assert!(h.guest_mounts().is_empty());
    assert_eq!(h.manager.store().list_disks().unwrap().count(), 0);
}
