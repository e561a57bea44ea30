//! The disk mount manager.
//!
//! [`DiskMountManager`] owns the VM session, the per-disk registry and the
//! state store, and implements the attach, mount, unmount and list calls.
//! The VM is started lazily by the first call that needs it, and persisted
//! disks are replayed onto it before that call proceeds.
//!
//! Locks are always taken in the order session, disk slot, mountpoint index.

use crate::attach::{is_live, DiskAttachCoordinator};
use crate::config::VmdiskConfig;
use crate::disk::{DiskHandle, DiskId, DiskKind, MountInfo, MountRecord};
use crate::error::{Error, Result};
use crate::host::{HostDisks, SystemHost};
use crate::mount::PartitionMountOrchestrator;
use crate::recovery::{RecoveryReport, VmLifecycleRecoveryAgent};
use crate::registry::{DiskRegistry, DiskSlot, MountpointIndex};
use crate::store::StateStore;
use crate::unmount::UnmountCoordinator;
use crate::vm::{backend, VmBackend, VmInstance};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use vmdisk_protocol::MountStatus;

/// A disk as reported by [`DiskMountManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DiskStatus {
    /// Disk identity.
    pub disk: String,
    /// Disk kind.
    pub kind: DiskKind,
    /// Whether a persisted record exists.
    pub persisted: bool,
    /// Whether the disk is attached to the running VM.
    pub attached: bool,
    /// LUN on the running VM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lun: Option<u32>,
    /// Guest device node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Partitions, requested or mounted.
    pub partitions: Vec<PartitionStatus>,
}

/// A partition as reported by [`DiskMountManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PartitionStatus {
    /// Partition index, 0 for the whole disk.
    pub partition: u32,
    /// Mount as requested.
    pub requested: MountRecord,
    /// Live mount, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounted: Option<MountInfo>,
}

/// Marks a call in progress so idle release waits for it.
struct Activity<'a> {
    manager: &'a DiskMountManager,
}

impl<'a> Activity<'a> {
    fn begin(manager: &'a DiskMountManager) -> Self {
        manager.in_flight.fetch_add(1, Ordering::SeqCst);
        *manager.last_activity.lock() = Instant::now();
        Self { manager }
    }
}

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        *self.manager.last_activity.lock() = Instant::now();
        self.manager.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Attaches host disks to a utility VM and mounts their partitions.
pub struct DiskMountManager {
    store: StateStore,
    host: Arc<dyn HostDisks>,
    backend: Option<Arc<dyn VmBackend>>,
    mount_root: String,
    session: Mutex<Option<Arc<dyn VmInstance>>>,
    registry: DiskRegistry,
    index: MountpointIndex,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl DiskMountManager {
    /// Create a manager. Without a backend every VM-dependent call fails
    /// with [`Error::UnsupportedHostConfiguration`].
    pub fn new(
        store: StateStore,
        host: Arc<dyn HostDisks>,
        backend: Option<Arc<dyn VmBackend>>,
        mount_root: impl Into<String>,
    ) -> Self {
        Self {
            store,
            host,
            backend,
            mount_root: mount_root.into(),
            session: Mutex::new(None),
            registry: DiskRegistry::new(),
            index: MountpointIndex::new(),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a manager for this host from `config`.
    pub fn from_config(config: &VmdiskConfig) -> Result<Self> {
        let store = StateStore::open(&config.state_path)?;
        let backend = match backend::from_config(config) {
            Ok(backend) => Some(backend),
            Err(e) => {
                debug!(error = %e, "no vm backend");
                None
            }
        };
        Ok(Self::new(
            store,
            Arc::new(SystemHost::new()),
            backend,
            config.mount_root.clone(),
        ))
    }

    /// The state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Guest directory mounts are created under.
    pub fn mount_root(&self) -> &str {
        &self.mount_root
    }

    /// Attach a disk without mounting anything.
    pub fn attach(&self, path: impl AsRef<Path>, kind: DiskKind) -> Result<DiskHandle> {
        let _activity = Activity::begin(self);
        let id = self.resolve(kind, path.as_ref())?;
        let vm = self.ensure_vm()?;

        let slot = self.registry.slot(&id);
        let result = self.attach_locked(vm.as_ref(), &mut slot.lock(), &id, kind);
        drop(slot);
        self.registry.prune(&id);
        result
    }

    /// Mount one partition, attaching the disk first if needed.
    ///
    /// A failed mount leaves the disk attached.
    pub fn mount(
        &self,
        path: impl AsRef<Path>,
        kind: DiskKind,
        record: MountRecord,
    ) -> Result<MountInfo> {
        let _activity = Activity::begin(self);
        let id = self.resolve(kind, path.as_ref())?;
        let vm = self.ensure_vm()?;

        let slot = self.registry.slot(&id);
        let result = {
            let mut slot = slot.lock();
            self.attach_locked(vm.as_ref(), &mut slot, &id, kind)
                .and_then(|handle| {
                    PartitionMountOrchestrator::new(&self.store, &self.index, &self.mount_root)
                        .mount(vm.as_ref(), &handle, &mut slot, record)
                        .map_err(Error::from)
                })
        };
        drop(slot);
        self.registry.prune(&id);
        result
    }

    /// [`mount`](Self::mount) reporting the `{result, step}` pair.
    pub fn mount_status(
        &self,
        path: impl AsRef<Path>,
        kind: DiskKind,
        record: MountRecord,
    ) -> MountStatus {
        match self.mount(path, kind, record) {
            Ok(_) => MountStatus::mounted(),
            Err(e) => e.status(),
        }
    }

    /// Unmount and detach a disk and delete its record.
    ///
    /// Never starts the VM. Works for any spelling of the path the disk
    /// was recorded under, and succeeds when nothing is known about it.
    pub fn unmount(&self, path: impl AsRef<Path>) -> Result<()> {
        let _activity = Activity::begin(self);
        let vm = self.current_vm();
        let unmount = self.unmount_coordinator();

        let mut first_error = None;
        for id in DiskId::candidates(path.as_ref())? {
            if let Err(e) = unmount.unmount_disk(vm.as_deref(), &id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Unmount every attached or persisted disk.
    pub fn unmount_all(&self) -> Result<()> {
        let _activity = Activity::begin(self);
        let vm = self.current_vm();
        self.unmount_coordinator().unmount_all(vm.as_deref())
    }

    /// Persisted and live disks, sorted by identity.
    pub fn list(&self) -> Result<Vec<DiskStatus>> {
        let vm = self.current_vm();
        let mut disks: BTreeMap<DiskId, DiskStatus> = BTreeMap::new();

        for persisted in self.store.list_disks()? {
            let partitions = persisted
                .mounts
                .into_iter()
                .map(|requested| PartitionStatus {
                    partition: requested.partition,
                    requested,
                    mounted: None,
                })
                .collect();
            disks.insert(
                persisted.id.clone(),
                DiskStatus {
                    disk: persisted.id.to_string(),
                    kind: persisted.kind,
                    persisted: true,
                    attached: false,
                    lun: None,
                    device: None,
                    partitions,
                },
            );
        }

        for id in self.registry.ids() {
            let Some(slot) = self.registry.get(&id) else {
                continue;
            };
            let slot = slot.lock();
            let Some(handle) = slot.handle.as_ref() else {
                continue;
            };
            let status = disks.entry(id.clone()).or_insert_with(|| DiskStatus {
                disk: id.to_string(),
                kind: handle.kind,
                persisted: false,
                attached: false,
                lun: None,
                device: None,
                partitions: Vec::new(),
            });
            if vm.as_deref().is_some_and(|vm| is_live(handle, vm)) {
                status.attached = true;
                status.lun = Some(handle.lun);
                status.device = Some(handle.guest_device.clone());
            }
            for (partition, live) in &slot.mounts {
                match status.partitions.iter_mut().find(|p| p.partition == *partition) {
                    Some(p) => p.mounted = Some(live.info.clone()),
                    None => status.partitions.push(PartitionStatus {
                        partition: *partition,
                        requested: live.record.clone(),
                        mounted: Some(live.info.clone()),
                    }),
                }
            }
            status.partitions.sort_by_key(|p| p.partition);
        }

        Ok(disks.into_values().collect())
    }

    /// Explicit full reset: delete every record, detach everything and stop
    /// the VM.
    pub fn shutdown_sweep(&self) -> Result<()> {
        let _activity = Activity::begin(self);
        let mut session = self.session.lock();
        let vm = session.take();
        let result = self.unmount_coordinator().shutdown_sweep(vm.as_deref());
        if let Some(vm) = vm {
            if let Err(e) = vm.stop() {
                warn!(error = %e, "failed to stop vm");
            }
        }
        result
    }

    /// Idle teardown: stop the VM and give pass-through disks back to the
    /// host. Persisted records are kept and replayed on the next start.
    ///
    /// Returns whether a VM was running.
    pub fn release_vm(&self) -> bool {
        let mut session = self.session.lock();
        self.release_locked(&mut session)
    }

    /// Release the VM if nothing happened for `timeout` and no call is in
    /// progress.
    ///
    /// The check runs under the session lock. A call counts itself in flight
    /// before it can obtain the VM, so a call holding the VM is always seen.
    pub fn release_if_idle(&self, timeout: Duration) -> bool {
        let mut session = self.session.lock();
        if self.in_flight.load(Ordering::SeqCst) > 0 || self.idle_for() < timeout {
            return false;
        }
        self.release_locked(&mut session)
    }

    fn release_locked(&self, session: &mut Option<Arc<dyn VmInstance>>) -> bool {
        let Some(vm) = session.take() else {
            return false;
        };
        info!(generation = vm.generation(), "releasing vm");
        if let Err(e) = vm.stop() {
            warn!(error = %e, "failed to stop vm");
        }
        self.drop_live_state();
        true
    }

    /// Time since the last call finished or started.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether a VM is running.
    pub fn is_vm_running(&self) -> bool {
        self.current_vm().is_some_and(|vm| vm.state().is_running())
    }

    /// Start the VM and replay persisted disks if no VM is running.
    ///
    /// A VM that died on its own is treated like an idle teardown first.
    pub fn ensure_vm(&self) -> Result<Arc<dyn VmInstance>> {
        let mut session = self.session.lock();
        if let Some(vm) = session.as_ref() {
            let state = vm.state();
            if state.is_running() {
                return Ok(vm.clone());
            }
            warn!(generation = vm.generation(), state = %state, "vm is gone");
            *session = None;
            self.drop_live_state();
        }

        let backend = self.backend.as_ref().ok_or_else(|| {
            Error::UnsupportedHostConfiguration("no vm runtime configured".into())
        })?;
        let vm = backend.start()?;
        info!(backend = backend.name(), generation = vm.generation(), "vm started");
        *session = Some(vm.clone());

        self.recover(vm.as_ref());
        Ok(vm)
    }

    fn recover(&self, vm: &dyn VmInstance) -> RecoveryReport {
        VmLifecycleRecoveryAgent::new(
            &self.store,
            self.host.as_ref(),
            &self.registry,
            &self.index,
            &self.mount_root,
        )
        .on_vm_became_available(vm)
    }

    fn current_vm(&self) -> Option<Arc<dyn VmInstance>> {
        self.session.lock().clone()
    }

    /// Resolve the identity and fail early for a missing disk.
    fn resolve(&self, kind: DiskKind, path: &Path) -> Result<DiskId> {
        let id = DiskId::resolve(kind, path)?;
        if !self.host.exists(&id) {
            return Err(Error::DiskNotFound {
                path: id.path().to_path_buf(),
            });
        }
        Ok(id)
    }

    fn attach_locked(
        &self,
        vm: &dyn VmInstance,
        slot: &mut DiskSlot,
        id: &DiskId,
        kind: DiskKind,
    ) -> Result<DiskHandle> {
        DiskAttachCoordinator::new(self.host.as_ref(), &self.store).attach(vm, slot, id, kind)
    }

    fn unmount_coordinator(&self) -> UnmountCoordinator<'_> {
        UnmountCoordinator::new(
            &self.store,
            self.host.as_ref(),
            &self.registry,
            &self.index,
            &self.mount_root,
        )
    }

    /// Forget everything tied to the previous VM. Caller holds the session
    /// lock.
    fn drop_live_state(&self) {
        let attach = DiskAttachCoordinator::new(self.host.as_ref(), &self.store);
        let orchestrator = PartitionMountOrchestrator::new(&self.store, &self.index, &self.mount_root);
        for id in self.registry.ids() {
            if let Some(slot) = self.registry.get(&id) {
                let mut slot = slot.lock();
                orchestrator.forget(&mut slot);
                if let Some(handle) = slot.handle.take() {
                    attach.restore_host(&handle);
                }
            }
        }
        self.registry.clear();
        self.index.clear();
    }
}
