//! In-memory attach and mount state.
//!
//! Each disk identity owns a [`DiskSlot`] behind its own mutex, so work on
//! one disk is serialized while different disks proceed in parallel. The
//! [`MountpointIndex`] is the only cross-disk structure and is held just
//! long enough to reserve or release a path.

use crate::disk::{DiskHandle, DiskId, MountInfo, MountRecord};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A live mount inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMount {
    /// Mount as requested.
    pub record: MountRecord,
    /// Mount as performed.
    pub info: MountInfo,
    /// Guest device node that was mounted.
    pub source: String,
}

/// Live state of one disk.
#[derive(Debug, Default)]
pub struct DiskSlot {
    /// Attachment to the current VM, if any.
    pub handle: Option<DiskHandle>,
    /// Live mounts by partition.
    pub mounts: BTreeMap<u32, LiveMount>,
}

impl DiskSlot {
    /// Whether the slot holds nothing.
    pub fn is_empty(&self) -> bool {
        self.handle.is_none() && self.mounts.is_empty()
    }
}

/// Per-disk slots keyed by identity.
#[derive(Default)]
pub struct DiskRegistry {
    slots: Mutex<HashMap<DiskId, Arc<Mutex<DiskSlot>>>>,
}

impl DiskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `id`, created on first use.
    pub fn slot(&self, id: &DiskId) -> Arc<Mutex<DiskSlot>> {
        self.slots.lock().entry(id.clone()).or_default().clone()
    }

    /// Slot for `id` if one exists.
    pub fn get(&self, id: &DiskId) -> Option<Arc<Mutex<DiskSlot>>> {
        self.slots.lock().get(id).cloned()
    }

    /// Identities with a slot, sorted.
    pub fn ids(&self) -> Vec<DiskId> {
        let mut ids: Vec<DiskId> = self.slots.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop the slot of `id` if nothing lives in it and nobody else
    /// holds a reference to it.
    ///
    /// The caller must drop its own reference first.
    pub fn prune(&self, id: &DiskId) {
        let mut slots = self.slots.lock();
        let unused = slots
            .get(id)
            .map(|slot| Arc::strong_count(slot) == 1 && slot.lock().is_empty());
        if unused == Some(true) {
            slots.remove(id);
        }
    }

    /// Remove every slot.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Owner of a reserved mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOwner {
    /// Disk the mount belongs to.
    pub disk: DiskId,
    /// Partition index.
    pub partition: u32,
}

/// System-wide mountpoint reservations.
#[derive(Default)]
pub struct MountpointIndex {
    paths: Mutex<HashMap<String, MountOwner>>,
}

impl MountpointIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `path` for `owner`. Returns the current owner on collision.
    pub fn reserve(&self, path: &str, owner: MountOwner) -> Result<(), MountOwner> {
        let mut paths = self.paths.lock();
        match paths.get(path) {
            Some(existing) if *existing != owner => Err(existing.clone()),
            _ => {
                paths.insert(path.to_string(), owner);
                Ok(())
            }
        }
    }

    /// Release `path`.
    pub fn release(&self, path: &str) {
        self.paths.lock().remove(path);
    }

    /// Owner of `path`.
    pub fn owner(&self, path: &str) -> Option<MountOwner> {
        self.paths.lock().get(path).cloned()
    }

    /// Release every path.
    pub fn clear(&self) {
        self.paths.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(disk: &str, partition: u32) -> MountOwner {
        MountOwner {
            disk: DiskId::from_stored(disk),
            partition,
        }
    }

    #[test]
    fn test_reserve_rejects_other_owner() {
        let index = MountpointIndex::new();
        index.reserve("/mnt/vmdisk/data", owner("/dev/sdb", 1)).unwrap();
        index.reserve("/mnt/vmdisk/data", owner("/dev/sdb", 1)).unwrap();

        let existing = index
            .reserve("/mnt/vmdisk/data", owner("/dev/sdc", 2))
            .unwrap_err();
        assert_eq!(existing, owner("/dev/sdb", 1));

        index.release("/mnt/vmdisk/data");
        index.reserve("/mnt/vmdisk/data", owner("/dev/sdc", 2)).unwrap();
    }

    #[test]
    fn test_registry_prunes_empty_slots() {
        let registry = DiskRegistry::new();
        let id = DiskId::from_stored("/dev/sdb");
        let slot = registry.slot(&id);
        slot.lock().mounts.insert(
            1,
            LiveMount {
                record: MountRecord::partition(1),
                info: MountInfo {
                    path: "/mnt/vmdisk/devsdbp1".into(),
                    filesystem: "ext4".into(),
                    name: "devsdbp1".into(),
                },
                source: "/dev/sdb1".into(),
            },
        );

        registry.prune(&id);
        assert_eq!(registry.ids(), vec![id.clone()]);

        slot.lock().mounts.clear();
        // Still referenced by this test.
        registry.prune(&id);
        assert_eq!(registry.ids(), vec![id.clone()]);

        drop(slot);
        registry.prune(&id);
        assert!(registry.get(&id).is_none());
    }
}
