//! Attaching host disks to the utility VM.

use crate::disk::{DiskHandle, DiskId, DiskKind};
use crate::error::{Error, Result};
use crate::host::HostDisks;
use crate::registry::DiskSlot;
use crate::store::StateStore;
use crate::vm::VmInstance;
use tracing::{debug, info, warn};

/// Whether `handle` was created by `vm` and `vm` is still running.
pub fn is_live(handle: &DiskHandle, vm: &dyn VmInstance) -> bool {
    handle.generation == vm.generation() && vm.state().is_running()
}

/// Binds host disks to the VM and reverses the host-side effects on detach.
pub struct DiskAttachCoordinator<'a> {
    host: &'a dyn HostDisks,
    store: &'a StateStore,
}

impl<'a> DiskAttachCoordinator<'a> {
    /// Create a coordinator.
    pub fn new(host: &'a dyn HostDisks, store: &'a StateStore) -> Self {
        Self { host, store }
    }

    /// Attach `id` to `vm`, recording the result in `slot`.
    ///
    /// A disk already attached to this VM returns its existing handle.
    pub fn attach(
        &self,
        vm: &dyn VmInstance,
        slot: &mut DiskSlot,
        id: &DiskId,
        kind: DiskKind,
    ) -> Result<DiskHandle> {
        if let Some(handle) = &slot.handle {
            if is_live(handle, vm) {
                debug!(disk = %id, lun = handle.lun, "already attached");
                return Ok(handle.clone());
            }
            debug!(disk = %id, generation = handle.generation, "dropping stale handle");
            slot.handle = None;
        }

        if !self.host.exists(id) {
            return Err(Error::DiskNotFound {
                path: id.path().to_path_buf(),
            });
        }
        self.host.check_available(id, kind)?;

        let was_online = match kind {
            DiskKind::PassThrough => self.take_offline(id)?,
            DiskKind::Virtual => None,
        };

        let lun = match vm.hot_add_disk(id, kind) {
            Ok(lun) => lun,
            Err(e) => {
                self.restore_online(id, was_online);
                return Err(e);
            }
        };

        let guest_device = match vm.guest().resolve_device(lun) {
            Ok(device) => device,
            Err(e) => {
                self.rollback(vm, id, lun, was_online);
                return Err(Error::agent("resolve device", e.to_string()));
            }
        };

        if let Err(e) = self.store.upsert_disk(id, kind) {
            self.rollback(vm, id, lun, was_online);
            return Err(e);
        }

        let handle = DiskHandle {
            id: id.clone(),
            kind,
            lun,
            guest_device,
            was_online,
            generation: vm.generation(),
        };
        info!(
            disk = %id,
            kind = %kind,
            lun,
            device = %handle.guest_device,
            "attached"
        );
        slot.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Detach the disk held by `slot`. Nothing attached is a no-op.
    ///
    /// `vm` is the running VM, if any. A handle from an older VM only has
    /// its host-side state restored.
    pub fn detach(&self, vm: Option<&dyn VmInstance>, slot: &mut DiskSlot) -> Result<()> {
        let Some(handle) = slot.handle.take() else {
            return Ok(());
        };

        if let Some(vm) = vm.filter(|vm| is_live(&handle, *vm)) {
            if let Err(e) = vm.guest().release_device(handle.lun) {
                warn!(disk = %handle.id, lun = handle.lun, error = %e, "guest release failed");
            }
            if let Err(e) = vm.hot_remove_disk(handle.lun) {
                slot.handle = Some(handle);
                return Err(e);
            }
        }

        self.restore_online(&handle.id, handle.was_online);
        info!(disk = %handle.id, lun = handle.lun, "detached");
        Ok(())
    }

    /// Put back the host online state of a handle whose VM is gone.
    pub fn restore_host(&self, handle: &DiskHandle) {
        self.restore_online(&handle.id, handle.was_online);
    }

    /// Capture the online state and take an online disk offline.
    fn take_offline(&self, id: &DiskId) -> Result<Option<bool>> {
        let was_online = self.host.is_online(id)?;
        if was_online == Some(true) {
            self.host.set_online(id, false)?;
            debug!(disk = %id, "took disk offline");
        }
        Ok(was_online)
    }

    fn restore_online(&self, id: &DiskId, was_online: Option<bool>) {
        if was_online != Some(true) {
            return;
        }
        match self.host.set_online(id, true) {
            Ok(()) => debug!(disk = %id, "brought disk back online"),
            Err(e) => warn!(disk = %id, error = %e, "failed to bring disk back online"),
        }
    }

    fn rollback(&self, vm: &dyn VmInstance, id: &DiskId, lun: u32, was_online: Option<bool>) {
        if let Err(e) = vm.hot_remove_disk(lun) {
            warn!(disk = %id, lun, error = %e, "rollback detach failed");
        }
        self.restore_online(id, was_online);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{DiskCatalog, SimDisk, SimulatedBackend, SimulatedHost};
    use crate::vm::VmBackend;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StateStore, DiskCatalog, SimulatedHost) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.redb")).unwrap();
        let catalog = DiskCatalog::new();
        catalog.insert("/dev/online", SimDisk::pass_through(true));
        catalog.insert("/dev/offline", SimDisk::pass_through(false));
        catalog.insert("/img/a.vhdx", SimDisk::virtual_disk());
        let host = SimulatedHost::new(catalog.clone());
        (dir, store, catalog, host)
    }

    #[test]
    fn test_attach_is_idempotent() {
        let (_dir, store, catalog, host) = setup();
        let backend = SimulatedBackend::new(catalog);
        let vm = backend.start().unwrap();
        let coordinator = DiskAttachCoordinator::new(&host, &store);
        let id = DiskId::from_stored("/img/a.vhdx");
        let mut slot = DiskSlot::default();

        let first = coordinator
            .attach(vm.as_ref(), &mut slot, &id, DiskKind::Virtual)
            .unwrap();
        let second = coordinator
            .attach(vm.as_ref(), &mut slot, &id, DiskKind::Virtual)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.current().unwrap().attached().len(), 1);
        assert!(store.get_disk(&id).unwrap().is_some());
    }

    #[test]
    fn test_online_state_is_restored() {
        let (_dir, store, catalog, host) = setup();
        let vm = SimulatedBackend::new(catalog.clone()).start().unwrap();
        let coordinator = DiskAttachCoordinator::new(&host, &store);

        for (path, before) in [("/dev/online", true), ("/dev/offline", false)] {
            let id = DiskId::from_stored(path);
            let mut slot = DiskSlot::default();
            coordinator
                .attach(vm.as_ref(), &mut slot, &id, DiskKind::PassThrough)
                .unwrap();
            assert_eq!(catalog.is_online(path), Some(false));

            coordinator.detach(Some(vm.as_ref()), &mut slot).unwrap();
            assert_eq!(catalog.is_online(path), Some(before));
            assert!(slot.handle.is_none());
        }
    }

    #[test]
    fn test_failed_attach_rolls_back_offline() {
        let (_dir, store, catalog, host) = setup();
        catalog.set_attach_failure("/dev/online", true);
        let vm = SimulatedBackend::new(catalog.clone()).start().unwrap();
        let coordinator = DiskAttachCoordinator::new(&host, &store);
        let id = DiskId::from_stored("/dev/online");
        let mut slot = DiskSlot::default();

        let err = coordinator
            .attach(vm.as_ref(), &mut slot, &id, DiskKind::PassThrough)
            .unwrap_err();
        assert!(matches!(err, Error::Vm(_)));
        assert_eq!(catalog.is_online("/dev/online"), Some(true));
        assert!(slot.handle.is_none());
        assert!(store.get_disk(&id).unwrap().is_none());
    }

    #[test]
    fn test_attach_errors() {
        let (_dir, store, catalog, host) = setup();
        catalog.set_in_use("/img/a.vhdx", true);
        let vm = SimulatedBackend::new(catalog).start().unwrap();
        let coordinator = DiskAttachCoordinator::new(&host, &store);
        let mut slot = DiskSlot::default();

        let err = coordinator
            .attach(
                vm.as_ref(),
                &mut slot,
                &DiskId::from_stored("/img/missing.vhdx"),
                DiskKind::Virtual,
            )
            .unwrap_err();
        assert!(err.is_not_found());

        let err = coordinator
            .attach(
                vm.as_ref(),
                &mut slot,
                &DiskId::from_stored("/img/a.vhdx"),
                DiskKind::Virtual,
            )
            .unwrap_err();
        assert!(matches!(err, Error::DiskInUse { .. }));
    }

    #[test]
    fn test_detach_without_handle_is_noop() {
        let (_dir, store, _catalog, host) = setup();
        let coordinator = DiskAttachCoordinator::new(&host, &store);
        let mut slot = DiskSlot::default();
        coordinator.detach(None, &mut slot).unwrap();
    }

    #[test]
    fn test_detach_after_vm_loss_restores_host() {
        let (_dir, store, catalog, host) = setup();
        let backend = SimulatedBackend::new(catalog.clone());
        let vm = backend.start().unwrap();
        let coordinator = DiskAttachCoordinator::new(&host, &store);
        let id = DiskId::from_stored("/dev/online");
        let mut slot = DiskSlot::default();
        coordinator
            .attach(vm.as_ref(), &mut slot, &id, DiskKind::PassThrough)
            .unwrap();

        backend.current().unwrap().kill();
        coordinator.detach(Some(vm.as_ref()), &mut slot).unwrap();
        assert_eq!(catalog.is_online("/dev/online"), Some(true));
    }
}
