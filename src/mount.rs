//! Staged partition mount pipeline.
//!
//! A mount runs a fixed sequence of stages, each of which can fail on its
//! own. A failure reports the negative errno together with the stage it
//! happened at:
//!
//! 1. [`MountStep::OpenDisk`]: the handle belongs to the running VM and the
//!    device opens.
//! 2. [`MountStep::FindPartition`]: skipped for whole-disk mounts.
//! 3. [`MountStep::DetectFilesystem`]: only when no type was given.
//! 4. [`MountStep::ResolveMountpoint`]: name validation, duplicate and
//!    collision checks.
//! 5. [`MountStep::CreateMountpointDirectory`]
//! 6. [`MountStep::Mount`]: a failure removes the directory again.
//!
//! The step codes are stable and shared with callers through
//! `vmdisk_protocol`.

use crate::attach::is_live;
use crate::disk::{validate_mount_name, DiskHandle, DiskId, MountInfo, MountRecord};
use crate::registry::{DiskSlot, LiveMount, MountOwner, MountpointIndex};
use crate::store::StateStore;
use crate::vm::{GuestError, VmInstance};
use std::fmt;
use tracing::{debug, info, warn};
use vmdisk_protocol::{errno, MountStatus, MountStep};

/// A stage of the mount or unmount path failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountFailure {
    /// Negative errno.
    pub errno: i32,
    /// Stage the failure happened at.
    pub stage: MountStep,
}

/// Unmount failures use the same shape.
pub type UnmountFailure = MountFailure;

impl MountFailure {
    /// Failure at `stage`. The errno may be given with either sign.
    pub fn new(errno: i32, stage: MountStep) -> Self {
        Self {
            errno: -errno.abs(),
            stage,
        }
    }

    fn guest(stage: MountStep, e: &GuestError) -> Self {
        Self::new(e.errno, stage)
    }
}

impl fmt::Display for MountFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} ({}): {} ({})",
            self.stage,
            self.stage.code(),
            self.errno,
            errno::name(self.errno)
        )
    }
}

impl std::error::Error for MountFailure {}

impl From<MountFailure> for MountStatus {
    fn from(failure: MountFailure) -> Self {
        MountStatus {
            result: failure.errno,
            step: failure.stage,
        }
    }
}

/// Guest mountpoint for `name` under `root`.
pub fn mountpoint_path(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), name)
}

/// Drives the mount pipeline for partitions of attached disks.
pub struct PartitionMountOrchestrator<'a> {
    store: &'a StateStore,
    index: &'a MountpointIndex,
    mount_root: &'a str,
}

impl<'a> PartitionMountOrchestrator<'a> {
    /// Create an orchestrator mounting under `mount_root`.
    pub fn new(store: &'a StateStore, index: &'a MountpointIndex, mount_root: &'a str) -> Self {
        Self {
            store,
            index,
            mount_root,
        }
    }

    /// Mount one partition of the disk behind `handle`.
    ///
    /// On success the record is persisted and added to `slot`.
    pub fn mount(
        &self,
        vm: &dyn VmInstance,
        handle: &DiskHandle,
        slot: &mut DiskSlot,
        record: MountRecord,
    ) -> Result<MountInfo, MountFailure> {
        let guest = vm.guest();
        let disk = &handle.id;

        // OpenDisk
        if !is_live(handle, vm) {
            debug!(disk = %disk, "handle belongs to a previous vm");
            return Err(MountFailure::new(errno::ENOENT, MountStep::OpenDisk));
        }
        guest
            .probe_device(&handle.guest_device)
            .map_err(|e| fail(disk, MountStep::OpenDisk, &e))?;

        // FindPartition
        let source = if record.partition == 0 {
            handle.guest_device.clone()
        } else {
            guest
                .find_partition(&handle.guest_device, record.partition)
                .map_err(|e| fail(disk, MountStep::FindPartition, &e))?
        };

        // DetectFilesystem
        let filesystem = match &record.filesystem {
            Some(fstype) => fstype.clone(),
            None => guest
                .detect_filesystem(&source)
                .map_err(|e| fail(disk, MountStep::DetectFilesystem, &e))?,
        };

        // ResolveMountpoint
        let name = record.mount_name(disk);
        if let Err(reason) = validate_mount_name(&name) {
            warn!(disk = %disk, name = %name, reason, "invalid mount name");
            return Err(MountFailure::new(errno::EINVAL, MountStep::ResolveMountpoint));
        }
        if let Some(existing) = slot.mounts.get(&record.partition) {
            warn!(
                disk = %disk,
                partition = record.partition,
                path = %existing.info.path,
                "partition is already mounted"
            );
            return Err(MountFailure::new(errno::EBUSY, MountStep::ResolveMountpoint));
        }
        let path = mountpoint_path(self.mount_root, &name);
        let owner = MountOwner {
            disk: disk.clone(),
            partition: record.partition,
        };
        if let Err(existing) = self.index.reserve(&path, owner) {
            warn!(
                disk = %disk,
                path = %path,
                owner = %existing.disk,
                owner_partition = existing.partition,
                "mount name collision"
            );
            return Err(MountFailure::new(errno::EEXIST, MountStep::ResolveMountpoint));
        }

        // CreateMountpointDirectory
        if let Err(e) = guest.create_mountpoint(&path) {
            self.index.release(&path);
            return Err(fail(disk, MountStep::CreateMountpointDirectory, &e));
        }

        // Mount
        if let Err(e) = guest.mount(&source, &path, &filesystem, record.options.as_deref()) {
            if let Err(rm) = guest.remove_mountpoint(&path) {
                warn!(path = %path, error = %rm, "failed to remove mountpoint after failed mount");
            }
            self.index.release(&path);
            return Err(fail(disk, MountStep::Mount, &e));
        }

        if let Err(e) = self.store.upsert_mount(disk, &record) {
            warn!(disk = %disk, error = %e, "failed to persist mount, rolling back");
            if let Err(e) = guest.unmount(&path) {
                warn!(path = %path, error = %e, "rollback unmount failed");
            } else if let Err(e) = guest.remove_mountpoint(&path) {
                warn!(path = %path, error = %e, "rollback rmdir failed");
            }
            self.index.release(&path);
            return Err(MountFailure::new(errno::EIO, MountStep::Mount));
        }

        let info = MountInfo {
            path,
            filesystem,
            name,
        };
        info!(
            disk = %disk,
            partition = record.partition,
            path = %info.path,
            fstype = %info.filesystem,
            "mounted"
        );
        slot.mounts.insert(
            record.partition,
            LiveMount {
                record,
                info: info.clone(),
                source,
            },
        );
        Ok(info)
    }

    /// Unmount one partition. A partition that is not mounted is a no-op.
    ///
    /// The mount record is removed from the store once the partition is
    /// unmounted, even if removing the directory fails afterwards.
    pub fn unmount(
        &self,
        vm: &dyn VmInstance,
        disk: &DiskId,
        slot: &mut DiskSlot,
        partition: u32,
    ) -> Result<(), UnmountFailure> {
        let Some(live) = slot.mounts.get(&partition) else {
            return Ok(());
        };
        let path = live.info.path.clone();
        let guest = vm.guest();

        match guest.unmount(&path) {
            Ok(()) => {}
            // Not a mountpoint any more.
            Err(e) if e.errno == errno::EINVAL => {
                warn!(disk = %disk, path = %path, "mount was already gone");
            }
            Err(e) => return Err(fail(disk, MountStep::Unmount, &e)),
        }

        slot.mounts.remove(&partition);
        self.index.release(&path);
        if let Err(e) = self.store.remove_mount(disk, partition) {
            warn!(disk = %disk, partition, error = %e, "failed to remove mount record");
        }

        guest
            .remove_mountpoint(&path)
            .map_err(|e| fail(disk, MountStep::RemoveMountpoint, &e))?;

        info!(disk = %disk, partition, path = %path, "unmounted");
        Ok(())
    }

    /// Forget the live mounts of `slot` without touching the guest.
    ///
    /// Used when the VM that held them is gone.
    pub fn forget(&self, slot: &mut DiskSlot) {
        for live in std::mem::take(&mut slot.mounts).into_values() {
            self.index.release(&live.info.path);
        }
    }
}

fn fail(disk: &DiskId, stage: MountStep, e: &GuestError) -> MountFailure {
    warn!(disk = %disk, step = %stage, errno = e.errno, error = %e.message, "guest stage failed");
    MountFailure::guest(stage, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskKind;
    use crate::simulated::{DiskCatalog, SimDisk, SimulatedBackend, SimulatedVm};
    use crate::vm::VmBackend;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: StateStore,
        index: MountpointIndex,
        sim: Arc<SimulatedVm>,
        vm: Arc<dyn VmInstance>,
    }

    fn fixture(catalog: &DiskCatalog) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.redb")).unwrap();
        let backend = SimulatedBackend::new(catalog.clone());
        let vm = backend.start().unwrap();
        Fixture {
            _dir: dir,
            store,
            index: MountpointIndex::new(),
            sim: backend.current().unwrap(),
            vm,
        }
    }

    fn attach(fx: &Fixture, path: &str) -> DiskHandle {
        let id = DiskId::from_stored(path);
        let lun = fx.vm.hot_add_disk(&id, DiskKind::PassThrough).unwrap();
        let guest_device = fx.vm.guest().resolve_device(lun).unwrap();
        fx.store.upsert_disk(&id, DiskKind::PassThrough).unwrap();
        DiskHandle {
            id,
            kind: DiskKind::PassThrough,
            lun,
            guest_device,
            was_online: Some(true),
            generation: fx.vm.generation(),
        }
    }

    fn catalog() -> DiskCatalog {
        let catalog = DiskCatalog::new();
        catalog.insert(
            "/dev/disk0",
            SimDisk::pass_through(true).with_partitions(&["ext4", "", "vfat"]),
        );
        catalog
    }

    #[test]
    fn test_autodetect_mount() {
        let fx = fixture(&catalog());
        let handle = attach(&fx, "/dev/disk0");
        let orchestrator = PartitionMountOrchestrator::new(&fx.store, &fx.index, "/mnt/vmdisk");
        let mut slot = DiskSlot::default();

        let info = orchestrator
            .mount(fx.vm.as_ref(), &handle, &mut slot, MountRecord::partition(1))
            .unwrap();
        assert_eq!(info.path, "/mnt/vmdisk/devdisk0p1");
        assert_eq!(info.filesystem, "ext4");
        assert!(slot.mounts.contains_key(&1));

        let persisted = fx.store.get_disk(&handle.id).unwrap().unwrap();
        assert_eq!(persisted.mounts, vec![MountRecord::partition(1)]);
    }

    #[test]
    fn test_stage_failures() {
        let fx = fixture(&catalog());
        let handle = attach(&fx, "/dev/disk0");
        let orchestrator = PartitionMountOrchestrator::new(&fx.store, &fx.index, "/mnt/vmdisk");
        let mut slot = DiskSlot::default();
        let vm = fx.vm.as_ref();

        let err = orchestrator
            .mount(vm, &handle, &mut slot, MountRecord::partition(7))
            .unwrap_err();
        assert_eq!(err, MountFailure::new(errno::ENOENT, MountStep::FindPartition));

        let err = orchestrator
            .mount(vm, &handle, &mut slot, MountRecord::partition(2))
            .unwrap_err();
        assert_eq!(err, MountFailure::new(errno::EINVAL, MountStep::DetectFilesystem));

        let record = MountRecord {
            filesystem: Some("vfat".into()),
            ..MountRecord::partition(1)
        };
        let err = orchestrator.mount(vm, &handle, &mut slot, record).unwrap_err();
        assert_eq!(err, MountFailure::new(errno::EINVAL, MountStep::Mount));
        assert_eq!(MountStatus::from(err).result, -22);

        let record = MountRecord {
            name: Some("a/b".into()),
            ..MountRecord::partition(1)
        };
        let err = orchestrator.mount(vm, &handle, &mut slot, record).unwrap_err();
        assert_eq!(err, MountFailure::new(errno::EINVAL, MountStep::ResolveMountpoint));

        // Nothing was left behind.
        assert!(slot.mounts.is_empty());
        assert!(fx.index.owner("/mnt/vmdisk/devdisk0p1").is_none());
        assert!(fx.store.get_disk(&handle.id).unwrap().unwrap().mounts.is_empty());
    }

    #[test]
    fn test_failed_mount_removes_directory() {
        let fx = fixture(&catalog());
        let handle = attach(&fx, "/dev/disk0");
        let orchestrator = PartitionMountOrchestrator::new(&fx.store, &fx.index, "/mnt/vmdisk");
        let mut slot = DiskSlot::default();

        let record = MountRecord {
            filesystem: Some("xfs".into()),
            ..MountRecord::partition(3)
        };
        orchestrator
            .mount(fx.vm.as_ref(), &handle, &mut slot, record)
            .unwrap_err();

        assert!(!fx.sim.has_directory("/mnt/vmdisk/devdisk0p3"));
        assert!(fx.sim.mounts().is_empty());
        assert!(fx.index.owner("/mnt/vmdisk/devdisk0p3").is_none());
    }

    #[test]
    fn test_duplicate_partition_is_busy() {
        let fx = fixture(&catalog());
        let handle = attach(&fx, "/dev/disk0");
        let orchestrator = PartitionMountOrchestrator::new(&fx.store, &fx.index, "/mnt/vmdisk");
        let mut slot = DiskSlot::default();
        let vm = fx.vm.as_ref();

        orchestrator
            .mount(vm, &handle, &mut slot, MountRecord::partition(1))
            .unwrap();
        let record = MountRecord {
            name: Some("other".into()),
            ..MountRecord::partition(1)
        };
        let err = orchestrator.mount(vm, &handle, &mut slot, record).unwrap_err();
        assert_eq!(err, MountFailure::new(errno::EBUSY, MountStep::ResolveMountpoint));
    }

    #[test]
    fn test_unmount_is_idempotent() {
        let fx = fixture(&catalog());
        let handle = attach(&fx, "/dev/disk0");
        let orchestrator = PartitionMountOrchestrator::new(&fx.store, &fx.index, "/mnt/vmdisk");
        let mut slot = DiskSlot::default();
        let vm = fx.vm.as_ref();

        orchestrator
            .mount(vm, &handle, &mut slot, MountRecord::partition(1))
            .unwrap();
        orchestrator.unmount(vm, &handle.id, &mut slot, 1).unwrap();
        orchestrator.unmount(vm, &handle.id, &mut slot, 1).unwrap();

        assert!(slot.mounts.is_empty());
        assert!(fx.index.owner("/mnt/vmdisk/devdisk0p1").is_none());
        assert!(fx.store.get_disk(&handle.id).unwrap().unwrap().mounts.is_empty());
    }

    #[test]
    fn test_stale_handle_fails_open_disk() {
        let fx = fixture(&catalog());
        let mut handle = attach(&fx, "/dev/disk0");
        handle.generation = 0;
        let orchestrator = PartitionMountOrchestrator::new(&fx.store, &fx.index, "/mnt/vmdisk");
        let mut slot = DiskSlot::default();

        let err = orchestrator
            .mount(fx.vm.as_ref(), &handle, &mut slot, MountRecord::partition(1))
            .unwrap_err();
        assert_eq!(err.stage, MountStep::OpenDisk);
        assert_eq!(err.errno, -errno::ENOENT);
    }

    #[test]
    fn test_failure_display() {
        let failure = MountFailure::new(errno::ENOENT, MountStep::FindPartition);
        assert_eq!(failure.to_string(), "step find-partition (2): -2 (ENOENT)");
    }
}
