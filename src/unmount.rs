//! Unmounting and detaching disks, with or without a running VM.
//!
//! A per-disk unmount always ends by deleting the disk's persisted record,
//! so it succeeds as pure metadata cleanup when no VM is around. The
//! shutdown sweep is the only path that deletes every record at once.

use crate::attach::{is_live, DiskAttachCoordinator};
use crate::disk::DiskId;
use crate::error::{Error, Result};
use crate::host::HostDisks;
use crate::mount::PartitionMountOrchestrator;
use crate::registry::{DiskRegistry, DiskSlot, MountpointIndex};
use crate::store::StateStore;
use crate::vm::VmInstance;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Inverse of attach and mount.
pub struct UnmountCoordinator<'a> {
    store: &'a StateStore,
    host: &'a dyn HostDisks,
    registry: &'a DiskRegistry,
    index: &'a MountpointIndex,
    mount_root: &'a str,
}

impl<'a> UnmountCoordinator<'a> {
    /// Create a coordinator over the manager's state.
    pub fn new(
        store: &'a StateStore,
        host: &'a dyn HostDisks,
        registry: &'a DiskRegistry,
        index: &'a MountpointIndex,
        mount_root: &'a str,
    ) -> Self {
        Self {
            store,
            host,
            registry,
            index,
            mount_root,
        }
    }

    /// Unmount every partition of `id`, detach it and delete its record.
    ///
    /// If the guest refuses to unmount, the record is still deleted and the
    /// error returned; the disk stays attached so the call can be retried.
    pub fn unmount_disk(&self, vm: Option<&dyn VmInstance>, id: &DiskId) -> Result<()> {
        let mut first_error = None;

        if let Some(slot) = self.registry.get(id) {
            if let Err(e) = self.teardown(vm, &mut slot.lock(), id) {
                first_error = Some(e);
            }
            drop(slot);
            self.registry.prune(id);
        }

        if self.store.remove_disk(id)? {
            debug!(disk = %id, "removed persisted record");
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(disk = %id, "disk unmounted");
                Ok(())
            }
        }
    }

    /// Unmount every attached or persisted disk. Every disk is attempted;
    /// the first error is returned.
    pub fn unmount_all(&self, vm: Option<&dyn VmInstance>) -> Result<()> {
        let mut ids: BTreeSet<DiskId> = self.registry.ids().into_iter().collect();
        ids.extend(self.store.list_disks()?.map(|disk| disk.id));

        let mut first_error = None;
        for id in &ids {
            if let Err(e) = self.unmount_disk(vm, id) {
                warn!(disk = %id, error = %e, "unmount failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete every persisted record, then detach everything best effort.
    pub fn shutdown_sweep(&self, vm: Option<&dyn VmInstance>) -> Result<()> {
        let cleared = self.store.clear_all();
        if let Err(e) = &cleared {
            warn!(error = %e, "failed to clear persisted disks");
        }

        for id in self.registry.ids() {
            let Some(slot) = self.registry.get(&id) else {
                continue;
            };
            let mut slot = slot.lock();
            if let Err(e) = self.teardown(vm, &mut slot, &id) {
                warn!(disk = %id, error = %e, "sweep left disk attached");
                // The VM is about to go away; make sure the host gets the
                // disk back anyway.
                self.forget(&mut slot);
            }
        }
        self.registry.clear();
        self.index.clear();

        info!("shutdown sweep complete");
        cleared
    }

    /// Unmount and detach the live state of one disk.
    fn teardown(&self, vm: Option<&dyn VmInstance>, slot: &mut DiskSlot, id: &DiskId) -> Result<()> {
        let live_vm = vm.filter(|vm| slot.handle.as_ref().is_some_and(|h| is_live(h, *vm)));
        let Some(vm) = live_vm else {
            self.forget(slot);
            return Ok(());
        };

        let orchestrator = PartitionMountOrchestrator::new(self.store, self.index, self.mount_root);
        let partitions: Vec<u32> = slot.mounts.keys().copied().collect();
        let mut first_error = None;
        for partition in partitions {
            if let Err(failure) = orchestrator.unmount(vm, id, slot, partition) {
                warn!(
                    disk = %id,
                    partition,
                    step = %failure.stage,
                    errno = failure.errno,
                    "unmount failed"
                );
                first_error.get_or_insert(Error::UnmountFailed(failure));
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        DiskAttachCoordinator::new(self.host, self.store).detach(Some(vm), slot)
    }

    /// Drop live state that no running VM backs.
    fn forget(&self, slot: &mut DiskSlot) {
        PartitionMountOrchestrator::new(self.store, self.index, self.mount_root).forget(slot);
        if let Some(handle) = slot.handle.take() {
            DiskAttachCoordinator::new(self.host, self.store).restore_host(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskKind, MountRecord};
    use crate::simulated::{DiskCatalog, SimDisk, SimulatedBackend, SimulatedHost};
    use crate::vm::VmBackend;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: StateStore,
        catalog: DiskCatalog,
        host: SimulatedHost,
        registry: DiskRegistry,
        index: MountpointIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = StateStore::open(dir.path().join("state.redb")).unwrap();
            let catalog = DiskCatalog::new();
            catalog.insert("/dev/sdx", SimDisk::pass_through(true).with_partitions(&["ext4"]));
            Self {
                _dir: dir,
                store,
                host: SimulatedHost::new(catalog.clone()),
                catalog,
                registry: DiskRegistry::new(),
                index: MountpointIndex::new(),
            }
        }

        fn coordinator(&self) -> UnmountCoordinator<'_> {
            UnmountCoordinator::new(&self.store, &self.host, &self.registry, &self.index, "/mnt/vmdisk")
        }

        fn attach_and_mount(&self, vm: &dyn VmInstance, id: &DiskId) {
            let slot = self.registry.slot(id);
            let mut slot = slot.lock();
            let handle = DiskAttachCoordinator::new(&self.host, &self.store)
                .attach(vm, &mut slot, id, DiskKind::PassThrough)
                .unwrap();
            PartitionMountOrchestrator::new(&self.store, &self.index, "/mnt/vmdisk")
                .mount(vm, &handle, &mut slot, MountRecord::partition(1))
                .unwrap();
        }
    }

    #[test]
    fn test_unmount_live_disk() {
        let fx = Fixture::new();
        let backend = SimulatedBackend::new(fx.catalog.clone());
        let vm = backend.start().unwrap();
        let id = DiskId::from_stored("/dev/sdx");
        fx.attach_and_mount(vm.as_ref(), &id);

        fx.coordinator().unmount_disk(Some(vm.as_ref()), &id).unwrap();

        let sim = backend.current().unwrap();
        assert!(sim.mounts().is_empty());
        assert!(sim.attached().is_empty());
        assert!(fx.store.get_disk(&id).unwrap().is_none());
        assert!(fx.registry.get(&id).is_none());
        assert_eq!(fx.catalog.is_online("/dev/sdx"), Some(true));
    }

    #[test]
    fn test_unmount_without_vm_is_metadata_cleanup() {
        let fx = Fixture::new();
        let id = DiskId::from_stored("/img/a.vhdx");
        fx.store.upsert_disk(&id, DiskKind::Virtual).unwrap();
        fx.store.upsert_mount(&id, &MountRecord::partition(1)).unwrap();

        fx.coordinator().unmount_disk(None, &id).unwrap();
        assert!(fx.store.get_disk(&id).unwrap().is_none());

        // Nothing left to do the second time.
        fx.coordinator().unmount_disk(None, &id).unwrap();
    }

    #[test]
    fn test_unmount_after_vm_loss_restores_host() {
        let fx = Fixture::new();
        let backend = SimulatedBackend::new(fx.catalog.clone());
        let vm = backend.start().unwrap();
        let id = DiskId::from_stored("/dev/sdx");
        fx.attach_and_mount(vm.as_ref(), &id);
        backend.current().unwrap().kill();

        fx.coordinator().unmount_disk(Some(vm.as_ref()), &id).unwrap();
        assert_eq!(fx.catalog.is_online("/dev/sdx"), Some(true));
        assert!(fx.index.owner("/mnt/vmdisk/devsdxp1").is_none());
        assert!(fx.store.get_disk(&id).unwrap().is_none());
    }

    #[test]
    fn test_shutdown_sweep_clears_everything() {
        let fx = Fixture::new();
        let backend = SimulatedBackend::new(fx.catalog.clone());
        let vm = backend.start().unwrap();
        let id = DiskId::from_stored("/dev/sdx");
        fx.attach_and_mount(vm.as_ref(), &id);
        let other = DiskId::from_stored("/img/unplugged.vhdx");
        fx.store.upsert_disk(&other, DiskKind::Virtual).unwrap();

        fx.coordinator().shutdown_sweep(Some(vm.as_ref())).unwrap();

        assert_eq!(fx.store.list_disks().unwrap().count(), 0);
        assert!(fx.registry.ids().is_empty());
        assert!(backend.current().unwrap().attached().is_empty());
        assert_eq!(fx.catalog.is_online("/dev/sdx"), Some(true));
    }
}
