//! In-memory host, VM and guest.
//!
//! The simulation keeps enough state to exercise the disk manager end to
//! end without a hypervisor: a catalog of host disks with partition layouts
//! and online flags, a VM that hands out LUNs, and a guest that tracks
//! mountpoint directories and mounts.

use crate::disk::{DiskId, DiskKind};
use crate::error::{Error, Result};
use crate::host::HostDisks;
use crate::vm::{next_generation, Guest, GuestError, GuestResult, VmBackend, VmInstance, VmState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vmdisk_protocol::errno;

/// A simulated host disk.
#[derive(Debug, Clone)]
pub struct SimDisk {
    whole: Option<String>,
    partitions: Vec<Option<String>>,
    online: Option<bool>,
    in_use: bool,
    fail_attach: bool,
}

impl SimDisk {
    /// A virtual disk image without a filesystem.
    pub fn virtual_disk() -> Self {
        Self {
            whole: None,
            partitions: Vec::new(),
            online: None,
            in_use: false,
            fail_attach: false,
        }
    }

    /// A physical disk, currently online or offline on the host.
    pub fn pass_through(online: bool) -> Self {
        Self {
            online: Some(online),
            ..Self::virtual_disk()
        }
    }

    /// Filesystem on the whole disk.
    pub fn with_filesystem(mut self, fstype: &str) -> Self {
        self.whole = Some(fstype.to_string());
        self
    }

    /// Partition table. An empty string is an unformatted partition.
    pub fn with_partitions(mut self, filesystems: &[&str]) -> Self {
        self.partitions = filesystems
            .iter()
            .map(|fs| (!fs.is_empty()).then(|| fs.to_string()))
            .collect();
        self
    }

    /// Filesystem at `partition`. Outer `None` means no such partition.
    fn filesystem(&self, partition: u32) -> Option<Option<&str>> {
        if partition == 0 {
            return Some(self.whole.as_deref());
        }
        self.partitions
            .get(partition as usize - 1)
            .map(|fs| fs.as_deref())
    }
}

/// Shared catalog of simulated host disks.
#[derive(Clone, Default)]
pub struct DiskCatalog {
    disks: Arc<Mutex<HashMap<PathBuf, SimDisk>>>,
}

impl DiskCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a disk.
    pub fn insert(&self, path: impl AsRef<Path>, disk: SimDisk) {
        self.disks.lock().insert(path.as_ref().to_path_buf(), disk);
    }

    /// Remove a disk, as if unplugged.
    pub fn remove(&self, path: impl AsRef<Path>) {
        self.disks.lock().remove(path.as_ref());
    }

    /// Mark a disk as held by a host process.
    pub fn set_in_use(&self, path: impl AsRef<Path>, in_use: bool) {
        if let Some(disk) = self.disks.lock().get_mut(path.as_ref()) {
            disk.in_use = in_use;
        }
    }

    /// Make VM-side attach of a disk fail.
    pub fn set_attach_failure(&self, path: impl AsRef<Path>, fail: bool) {
        if let Some(disk) = self.disks.lock().get_mut(path.as_ref()) {
            disk.fail_attach = fail;
        }
    }

    /// Host online state of a disk.
    pub fn is_online(&self, path: impl AsRef<Path>) -> Option<bool> {
        self.disks.lock().get(path.as_ref()).and_then(|d| d.online)
    }

    fn get(&self, path: &Path) -> Option<SimDisk> {
        self.disks.lock().get(path).cloned()
    }
}

/// Simulated host disk control.
pub struct SimulatedHost {
    catalog: DiskCatalog,
}

impl SimulatedHost {
    /// Host backed by `catalog`.
    pub fn new(catalog: DiskCatalog) -> Self {
        Self { catalog }
    }
}

impl HostDisks for SimulatedHost {
    fn exists(&self, disk: &DiskId) -> bool {
        self.catalog.get(disk.path()).is_some()
    }

    fn check_available(&self, disk: &DiskId, _kind: DiskKind) -> Result<()> {
        match self.catalog.get(disk.path()) {
            None => Err(Error::DiskNotFound {
                path: disk.path().to_path_buf(),
            }),
            Some(d) if d.in_use => Err(Error::in_use(disk.path(), "open handle on a volume")),
            Some(_) => Ok(()),
        }
    }

    fn is_online(&self, disk: &DiskId) -> Result<Option<bool>> {
        Ok(self.catalog.is_online(disk.path()))
    }

    fn set_online(&self, disk: &DiskId, online: bool) -> Result<()> {
        let mut disks = self.catalog.disks.lock();
        match disks.get_mut(disk.path()) {
            Some(d) if d.online.is_some() => {
                d.online = Some(online);
                Ok(())
            }
            _ => Err(Error::host_state(disk.path(), "not controllable")),
        }
    }
}

/// Backend that starts [`SimulatedVm`]s.
pub struct SimulatedBackend {
    catalog: DiskCatalog,
    current: Mutex<Option<Arc<SimulatedVm>>>,
    starts: AtomicUsize,
}

impl SimulatedBackend {
    /// Backend whose VMs see the disks in `catalog`.
    pub fn new(catalog: DiskCatalog) -> Self {
        Self {
            catalog,
            current: Mutex::new(None),
            starts: AtomicUsize::new(0),
        }
    }

    /// The most recently started VM.
    pub fn current(&self) -> Option<Arc<SimulatedVm>> {
        self.current.lock().clone()
    }

    /// How many VMs were started.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl VmBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn start(&self) -> Result<Arc<dyn VmInstance>> {
        let vm = Arc::new(SimulatedVm::new(self.catalog.clone()));
        *self.current.lock() = Some(vm.clone());
        self.starts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(generation = vm.generation, "simulated vm started");
        Ok(vm)
    }
}

#[derive(Default)]
struct SimState {
    next_lun: u32,
    luns: BTreeMap<u32, PathBuf>,
    dirs: BTreeSet<String>,
    /// target -> (source, fstype)
    mounts: BTreeMap<String, (String, String)>,
}

/// A simulated utility VM and its guest.
pub struct SimulatedVm {
    generation: u64,
    catalog: DiskCatalog,
    vm_state: Mutex<VmState>,
    state: Mutex<SimState>,
}

impl SimulatedVm {
    fn new(catalog: DiskCatalog) -> Self {
        Self {
            generation: next_generation(),
            catalog,
            vm_state: Mutex::new(VmState::Running),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Make the VM vanish without going through the manager.
    pub fn kill(&self) {
        *self.vm_state.lock() = VmState::Failed {
            reason: "killed".to_string(),
        };
        *self.state.lock() = SimState::default();
    }

    /// Mounted targets and their filesystem types.
    pub fn mounts(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .mounts
            .iter()
            .map(|(target, (_, fstype))| (target.clone(), fstype.clone()))
            .collect()
    }

    /// Whether a directory exists in the guest.
    pub fn has_directory(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(path)
    }

    /// Host paths of the attached disks.
    pub fn attached(&self) -> Vec<PathBuf> {
        self.state.lock().luns.values().cloned().collect()
    }

    fn ensure_running(&self) -> GuestResult<()> {
        if self.vm_state.lock().is_running() {
            Ok(())
        } else {
            Err(GuestError::transport("vm is not running"))
        }
    }

    /// Host disk and partition behind a guest device node.
    fn lookup(&self, device: &str) -> GuestResult<(SimDisk, u32)> {
        let missing = || GuestError::new(errno::ENXIO, format!("no such device {}", device));
        let (lun, partition) = parse_device(device).ok_or_else(missing)?;
        let path = self.state.lock().luns.get(&lun).cloned().ok_or_else(missing)?;
        let disk = self.catalog.get(&path).ok_or_else(missing)?;
        Ok((disk, partition))
    }
}

/// Device node for `lun`, named like the Linux sd driver: `sdb`..`sdz`,
/// then `sdaa`, `sdab`, ... `sda` is the root disk.
fn device_name(lun: u32) -> String {
    let mut index = u64::from(lun) + 1;
    let mut letters = Vec::new();
    loop {
        letters.push(b'a' + (index % 26) as u8);
        index /= 26;
        if index == 0 {
            break;
        }
        index -= 1;
    }
    letters.reverse();
    format!("/dev/sd{}", String::from_utf8_lossy(&letters))
}

/// LUN and partition index of a device node.
fn parse_device(device: &str) -> Option<(u32, u32)> {
    let rest = device.strip_prefix("/dev/sd")?;
    let split = rest
        .find(|c: char| !c.is_ascii_lowercase())
        .unwrap_or(rest.len());
    let (letters, digits) = rest.split_at(split);
    if letters.is_empty() {
        return None;
    }

    let mut value: u64 = 0;
    for c in letters.bytes() {
        value = value
            .checked_mul(26)?
            .checked_add(u64::from(c - b'a') + 1)?;
    }
    // `sda` is the root disk, `sdb` is LUN 0.
    let lun = u32::try_from(value.checked_sub(2)?).ok()?;

    let partition = if digits.is_empty() {
        0
    } else {
        digits.parse().ok()?
    };
    Some((lun, partition))
}

impl VmInstance for SimulatedVm {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn state(&self) -> VmState {
        self.vm_state.lock().clone()
    }

    fn hot_add_disk(&self, disk: &DiskId, _kind: DiskKind) -> Result<u32> {
        if !self.vm_state.lock().is_running() {
            return Err(Error::vm("vm is not running"));
        }
        let sim = self.catalog.get(disk.path()).ok_or_else(|| Error::DiskNotFound {
            path: disk.path().to_path_buf(),
        })?;
        if sim.fail_attach {
            return Err(Error::vm(format!("failed to attach {}", disk)));
        }

        let mut state = self.state.lock();
        if state.luns.values().any(|p| p == disk.path()) {
            return Err(Error::vm(format!("{} is already attached", disk)));
        }
        let lun = state.next_lun;
        state.next_lun = lun
            .checked_add(1)
            .ok_or_else(|| Error::vm("out of LUNs"))?;
        state.luns.insert(lun, disk.path().to_path_buf());
        Ok(lun)
    }

    fn hot_remove_disk(&self, lun: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.luns.remove(&lun).is_none() {
            return Err(Error::vm(format!("no disk at lun {}", lun)));
        }
        Ok(())
    }

    fn guest(&self) -> &dyn Guest {
        self
    }

    fn stop(&self) -> Result<()> {
        *self.vm_state.lock() = VmState::Stopped;
        *self.state.lock() = SimState::default();
        Ok(())
    }
}

impl Guest for SimulatedVm {
    fn resolve_device(&self, lun: u32) -> GuestResult<String> {
        self.ensure_running()?;
        if self.state.lock().luns.contains_key(&lun) {
            Ok(device_name(lun))
        } else {
            Err(GuestError::new(errno::ENOENT, format!("no block device for lun {}", lun)))
        }
    }

    fn probe_device(&self, device: &str) -> GuestResult<()> {
        self.ensure_running()?;
        self.lookup(device).map(|_| ())
    }

    fn find_partition(&self, device: &str, index: u32) -> GuestResult<String> {
        self.ensure_running()?;
        let (disk, _) = self.lookup(device)?;
        match disk.filesystem(index) {
            Some(_) => Ok(format!("{}{}", device, index)),
            None => Err(GuestError::new(
                errno::ENOENT,
                format!("partition {} not found on {}", index, device),
            )),
        }
    }

    fn detect_filesystem(&self, device: &str) -> GuestResult<String> {
        self.ensure_running()?;
        let (disk, partition) = self.lookup(device)?;
        match disk.filesystem(partition) {
            Some(Some(fstype)) => Ok(fstype.to_string()),
            _ => Err(GuestError::new(
                errno::EINVAL,
                format!("no filesystem detected on {}", device),
            )),
        }
    }

    fn create_mountpoint(&self, path: &str) -> GuestResult<()> {
        self.ensure_running()?;
        let mut state = self.state.lock();
        if state.mounts.contains_key(path) {
            return Err(GuestError::new(
                errno::ENOTEMPTY,
                format!("mountpoint {} is not empty", path),
            ));
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        _options: Option<&str>,
    ) -> GuestResult<()> {
        self.ensure_running()?;
        let (disk, partition) = self.lookup(source)?;

        let mut state = self.state.lock();
        if !state.dirs.contains(target) {
            return Err(GuestError::new(errno::ENOENT, format!("{} does not exist", target)));
        }
        if state.mounts.contains_key(target) || state.mounts.values().any(|(s, _)| s == source) {
            return Err(GuestError::new(errno::EBUSY, format!("{} is busy", target)));
        }
        match disk.filesystem(partition) {
            Some(Some(actual)) if actual == fstype => {}
            _ => {
                return Err(GuestError::new(
                    errno::EINVAL,
                    format!("wrong fs type on {}", source),
                ))
            }
        }

        state
            .mounts
            .insert(target.to_string(), (source.to_string(), fstype.to_string()));
        Ok(())
    }

    fn unmount(&self, target: &str) -> GuestResult<()> {
        self.ensure_running()?;
        match self.state.lock().mounts.remove(target) {
            Some(_) => Ok(()),
            None => Err(GuestError::new(errno::EINVAL, format!("{} is not mounted", target))),
        }
    }

    fn remove_mountpoint(&self, path: &str) -> GuestResult<()> {
        self.ensure_running()?;
        let mut state = self.state.lock();
        if state.mounts.contains_key(path) {
            return Err(GuestError::new(errno::EBUSY, format!("{} is mounted", path)));
        }
        state.dirs.remove(path);
        Ok(())
    }

    fn release_device(&self, _lun: u32) -> GuestResult<()> {
        self.ensure_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(device_name(0), "/dev/sdb");
        assert_eq!(parse_device("/dev/sdc"), Some((1, 0)));
        assert_eq!(parse_device("/dev/sdc12"), Some((1, 12)));
        assert_eq!(parse_device("/dev/sda"), None);
        assert_eq!(parse_device("/dev/vdb"), None);
        assert_eq!(device_name(24), "/dev/sdz");
        assert_eq!(device_name(25), "/dev/sdaa");
        assert_eq!(device_name(26), "/dev/sdab");
        assert_eq!(device_name(701), "/dev/sdaaa");
        for lun in [0, 24, 25, 26, 700, 701, 5000, u32::MAX] {
            assert_eq!(parse_device(&format!("{}3", device_name(lun))), Some((lun, 3)));
        }
    }

    #[test]
    fn test_many_attach_cycles_on_one_vm() {
        let catalog = DiskCatalog::new();
        catalog.insert("/dev/disk0", SimDisk::pass_through(true).with_partitions(&["ext4"]));
        let backend = SimulatedBackend::new(catalog);
        let vm = backend.start().unwrap();
        let id = DiskId::from_stored("/dev/disk0");
        let guest = vm.guest();

        for _ in 0..300 {
            let lun = vm.hot_add_disk(&id, DiskKind::PassThrough).unwrap();
            let dev = guest.resolve_device(lun).unwrap();
            let part = guest.find_partition(&dev, 1).unwrap();
            assert_eq!(guest.detect_filesystem(&part).unwrap(), "ext4");
            vm.hot_remove_disk(lun).unwrap();
        }
    }

    #[test]
    fn test_guest_mount_checks_filesystem() {
        let catalog = DiskCatalog::new();
        catalog.insert("/dev/disk0", SimDisk::pass_through(true).with_partitions(&["ext4"]));
        let backend = SimulatedBackend::new(catalog);
        let vm = backend.start().unwrap();
        let id = DiskId::from_stored("/dev/disk0");

        let lun = vm.hot_add_disk(&id, DiskKind::PassThrough).unwrap();
        let guest = vm.guest();
        let dev = guest.resolve_device(lun).unwrap();
        let part = guest.find_partition(&dev, 1).unwrap();
        assert_eq!(guest.detect_filesystem(&part).unwrap(), "ext4");
        assert_eq!(guest.find_partition(&dev, 2).unwrap_err().errno, errno::ENOENT);

        guest.create_mountpoint("/mnt/x").unwrap();
        let err = guest.mount(&part, "/mnt/x", "vfat", None).unwrap_err();
        assert_eq!(err.errno, errno::EINVAL);
        guest.mount(&part, "/mnt/x", "ext4", None).unwrap();
        assert_eq!(guest.remove_mountpoint("/mnt/x").unwrap_err().errno, errno::EBUSY);
    }

    #[test]
    fn test_killed_vm_refuses_work() {
        let backend = SimulatedBackend::new(DiskCatalog::new());
        backend.start().unwrap();
        let vm = backend.current().unwrap();
        vm.kill();
        assert!(vm.state().is_terminal());
        assert_eq!(vm.resolve_device(0).unwrap_err().errno, errno::EIO);
    }
}
