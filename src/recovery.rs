//! Replaying persisted disk state onto a freshly started VM.
//!
//! Every persisted disk is re-attached and its partitions re-mounted. Disks
//! are handled in parallel, one thread each. A disk that fails to attach
//! keeps its record so a later pass can pick it up; a partition that fails
//! to mount never takes its disk or its sibling partitions down with it.

use crate::attach::DiskAttachCoordinator;
use crate::disk::DiskId;
use crate::host::HostDisks;
use crate::mount::{MountFailure, PartitionMountOrchestrator};
use crate::registry::{DiskRegistry, DiskSlot, MountpointIndex};
use crate::store::{PersistedDisk, StateStore};
use crate::vm::VmInstance;
use std::thread;
use tracing::{info, warn};

/// Outcome of replaying one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecovery {
    /// Disk identity.
    pub id: DiskId,
    /// Whether the disk is attached to the new VM.
    pub attached: bool,
    /// Partitions mounted again.
    pub mounted: Vec<u32>,
    /// Partitions that failed to mount.
    pub failed: Vec<(u32, MountFailure)>,
    /// Attach error, if any.
    pub error: Option<String>,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// One entry per persisted disk.
    pub disks: Vec<DiskRecovery>,
}

impl RecoveryReport {
    /// Whether every disk attached and every partition mounted.
    pub fn is_clean(&self) -> bool {
        self.disks
            .iter()
            .all(|d| d.attached && d.failed.is_empty())
    }
}

/// Replays the state store whenever a VM becomes available.
pub struct VmLifecycleRecoveryAgent<'a> {
    store: &'a StateStore,
    host: &'a dyn HostDisks,
    registry: &'a DiskRegistry,
    index: &'a MountpointIndex,
    mount_root: &'a str,
}

impl<'a> VmLifecycleRecoveryAgent<'a> {
    /// Create a recovery agent over the manager's state.
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

    /// Attach and mount everything the store records. Never fails; problems
    /// are logged and reported per disk.
    pub fn on_vm_became_available(&self, vm: &dyn VmInstance) -> RecoveryReport {
        let disks: Vec<PersistedDisk> = match self.store.list_disks() {
            Ok(disks) => disks.collect(),
            Err(e) => {
                warn!(error = %e, "cannot read persisted disks, skipping recovery");
                return RecoveryReport::default();
            }
        };
        if disks.is_empty() {
            return RecoveryReport::default();
        }
        info!(count = disks.len(), generation = vm.generation(), "recovering disks");

        let results = thread::scope(|scope| {
            let handles: Vec<_> = disks
                .into_iter()
                .map(|disk| {
                    let id = disk.id.clone();
                    (id, scope.spawn(move || self.recover_disk(vm, disk)))
                })
                .collect();

            handles
                .into_iter()
                .map(|(id, handle)| {
                    handle.join().unwrap_or_else(|_| DiskRecovery {
                        id,
                        attached: false,
                        mounted: Vec::new(),
                        failed: Vec::new(),
                        error: Some("recovery thread panicked".to_string()),
                    })
                })
                .collect()
        });

        let report = RecoveryReport { disks: results };
        if report.is_clean() {
            info!(count = report.disks.len(), "recovery complete");
        } else {
            warn!(count = report.disks.len(), "recovery finished with failures");
        }
        report
    }

    fn recover_disk(&self, vm: &dyn VmInstance, disk: PersistedDisk) -> DiskRecovery {
        let mut outcome = DiskRecovery {
            id: disk.id.clone(),
            attached: false,
            mounted: Vec::new(),
            failed: Vec::new(),
            error: None,
        };

        let slot = self.registry.slot(&disk.id);
        self.replay(vm, &mut slot.lock(), disk, &mut outcome);
        drop(slot);
        self.registry.prune(&outcome.id);
        outcome
    }

    fn replay(
        &self,
        vm: &dyn VmInstance,
        slot: &mut DiskSlot,
        disk: PersistedDisk,
        outcome: &mut DiskRecovery,
    ) {
        let attach = DiskAttachCoordinator::new(self.host, self.store);
        let handle = match attach.attach(vm, slot, &disk.id, disk.kind) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(disk = %disk.id, error = %e, "recovery attach failed, keeping record");
                outcome.error = Some(e.to_string());
                return;
            }
        };
        outcome.attached = true;

        let orchestrator = PartitionMountOrchestrator::new(self.store, self.index, self.mount_root);
        for record in disk.mounts {
            let partition = record.partition;
            if slot.mounts.contains_key(&partition) {
                outcome.mounted.push(partition);
                continue;
            }
            match orchestrator.mount(vm, &handle, slot, record) {
                Ok(_) => outcome.mounted.push(partition),
                Err(failure) => {
                    warn!(
                        disk = %disk.id,
                        partition,
                        step = %failure.stage,
                        errno = failure.errno,
                        "recovery mount failed"
                    );
                    outcome.failed.push((partition, failure));
                }
            }
        }
    }
}
