//! In-memory hypervisor.
//!
//! [`FakeSession`] keeps VMs, disk chains, snapshots and xenstore data in
//! memory, journals every mutating call and fails on demand. It backs the
//! `simulate` command and the integration tests.

use crate::{
    Result, VmOpsError,
    instance::{BlockDeviceMapping, Flavor, Instance},
    session::{
        DiskRef, DiskTransfer, DiskType, PowerState, ProductVersion, SnapshotRef, VmRef,
        XenSession,
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A mutating call observed by the fake, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    SetNameLabel { vm: VmRef, name: String },
    DestroyVm { vm: VmRef },
    CleanShutdown { vm: VmRef },
    HardShutdown { vm: VmRef },
    Start { vm: VmRef },
    Snapshot { vm: VmRef, label: String },
    DestroySnapshot { snapshot: SnapshotRef },
    ResizeDiskCopy { disk: DiskRef, new_size_gb: u64 },
    DestroyDisk { disk: DiskRef },
    CopyDisk { disk: DiskRef, destination: String, sr_path: String, seq_num: u32 },
    Plugin { plugin: String, method: String },
    WriteXenstore { vm: VmRef, key: String, value: String },
    RemoveXenstore { vm: VmRef, key: String },
    ProbeIsPv { disk: DiskRef },
    AttachVolume { vm: VmRef, volume_id: String },
    DetachVolume { vm: VmRef, volume_id: String },
}

/// Where the fake should fail. Every matching call fails until cleared,
/// except `CopyDisk` which fails only its `nth` (1-based) copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPoint {
    CopyDisk { nth: usize },
    SetNameLabel { name: String },
    CleanShutdown,
    HardShutdown,
    Start,
    DestroyVm,
    Snapshot,
    DestroySnapshot,
    ResizeDiskCopy,
    DestroyDisk,
    Plugin,
}

#[derive(Debug, Clone)]
struct FakeVm {
    name_label: String,
    power: PowerState,
    dom_id: i64,
    root_disk: Option<DiskRef>,
    xenstore: BTreeMap<String, String>,
    volumes: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeDisk {
    parent: Option<DiskRef>,
    size_gb: u64,
}

#[derive(Debug, Default)]
struct FakeState {
    vms: BTreeMap<VmRef, FakeVm>,
    disks: BTreeMap<DiskRef, FakeDisk>,
    snapshots: BTreeMap<SnapshotRef, VmRef>,
    pv_disks: BTreeSet<DiskRef>,
    hidden_labels: BTreeSet<String>,
    plugin_responses: BTreeMap<(String, String), String>,
    transfers: Vec<DiskTransfer>,
    calls: Vec<Call>,
    failures: Vec<FailPoint>,
    copies_attempted: usize,
    plugin_calls: usize,
    next_id: u64,
    next_dom_id: i64,
}

impl FakeState {
    fn next_ref(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("OpaqueRef:{}-{}", kind, self.next_id)
    }

    fn allocate_dom_id(&mut self) -> i64 {
        self.next_dom_id += 1;
        self.next_dom_id
    }

    fn fails(&self, point: &FailPoint) -> bool {
        self.failures.contains(point)
    }

    fn vm(&self, vm: &VmRef) -> Result<&FakeVm> {
        self.vms
            .get(vm)
            .ok_or_else(|| VmOpsError::NotFound(format!("VM {}", vm)))
    }

    fn vm_mut(&mut self, vm: &VmRef) -> Result<&mut FakeVm> {
        self.vms
            .get_mut(vm)
            .ok_or_else(|| VmOpsError::NotFound(format!("VM {}", vm)))
    }
}

fn injected(what: &str) -> VmOpsError {
    VmOpsError::Session(format!("injected failure: {}", what))
}

pub struct FakeSession {
    state: Mutex<FakeState>,
    product_brand: Option<String>,
    product_version: Option<ProductVersion>,
    sr_path: String,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            product_brand: None,
            product_version: None,
            sr_path: "/var/run/sr-mount/fake-sr".to_string(),
        }
    }

    pub fn with_product(mut self, brand: &str, version: ProductVersion) -> Self {
        self.product_brand = Some(brand.to_string());
        self.product_version = Some(version);
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_vm(&self, name_label: &str, power: PowerState) -> VmRef {
        let mut state = self.state();
        let vm = VmRef::new(state.next_ref("vm"));
        let dom_id = if power == PowerState::Halted {
            -1
        } else {
            state.allocate_dom_id()
        };
        state.vms.insert(
            vm.clone(),
            FakeVm {
                name_label: name_label.to_string(),
                power,
                dom_id,
                root_disk: None,
                xenstore: BTreeMap::new(),
                volumes: Vec::new(),
            },
        );
        vm
    }

    /// Give `vm` a differencing chain, leaf first.
    pub fn create_disk_chain(&self, vm: &VmRef, chain: &[&str], size_gb: u64) -> Result<()> {
        let mut state = self.state();
        for (index, disk) in chain.iter().enumerate() {
            let parent = chain.get(index + 1).map(|parent| DiskRef::from(*parent));
            state
                .disks
                .insert(DiskRef::from(*disk), FakeDisk { parent, size_gb });
        }
        state.vm_mut(vm)?.root_disk = chain.first().map(|leaf| DiskRef::from(*leaf));
        Ok(())
    }

    pub fn set_dom_id(&self, vm: &VmRef, dom_id: i64) -> Result<()> {
        self.state().vm_mut(vm)?.dom_id = dom_id;
        Ok(())
    }

    pub fn set_plugin_response(&self, plugin: &str, method: &str, value: &str) {
        self.state()
            .plugin_responses
            .insert((plugin.to_string(), method.to_string()), value.to_string());
    }

    /// Make lookups by `name_label` find nothing, as if the VM had vanished
    /// from the host's index.
    pub fn hide_name_label(&self, name_label: &str) {
        self.state().hidden_labels.insert(name_label.to_string());
    }

    pub fn mark_pv(&self, disk: &DiskRef) {
        self.state().pv_disks.insert(disk.clone());
    }

    pub fn fail(&self, point: FailPoint) {
        self.state().failures.push(point);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn transfers(&self) -> Vec<DiskTransfer> {
        self.state().transfers.clone()
    }

    pub fn plugin_call_count(&self) -> usize {
        self.state().plugin_calls
    }

    pub fn snapshot_count(&self) -> usize {
        self.state().snapshots.len()
    }

    pub fn disk_exists(&self, disk: &DiskRef) -> bool {
        self.state().disks.contains_key(disk)
    }

    pub fn disk_size_gb(&self, disk: &DiskRef) -> Option<u64> {
        self.state().disks.get(disk).map(|record| record.size_gb)
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.state()
            .vms
            .values()
            .map(|vm| vm.name_label.clone())
            .collect()
    }

    pub fn vm_power(&self, vm: &VmRef) -> Option<PowerState> {
        self.state().vms.get(vm).map(|vm| vm.power)
    }

    pub fn vm_name(&self, vm: &VmRef) -> Option<String> {
        self.state().vms.get(vm).map(|vm| vm.name_label.clone())
    }

    pub fn vm_volumes(&self, vm: &VmRef) -> Vec<String> {
        self.state()
            .vms
            .get(vm)
            .map(|vm| vm.volumes.clone())
            .unwrap_or_default()
    }

    pub fn xenstore(&self, vm: &VmRef) -> BTreeMap<String, String> {
        self.state()
            .vms
            .get(vm)
            .map(|vm| vm.xenstore.clone())
            .unwrap_or_default()
    }

    pub fn attach_volume_directly(&self, vm: &VmRef, volume_id: &str) -> Result<()> {
        self.state().vm_mut(vm)?.volumes.push(volume_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl XenSession for FakeSession {
    fn product_brand(&self) -> Option<String> {
        self.product_brand.clone()
    }

    fn product_version(&self) -> Option<ProductVersion> {
        self.product_version
    }

    async fn lookup_vm(&self, name_label: &str) -> Result<Option<VmRef>> {
        let state = self.state();
        if state.hidden_labels.contains(name_label) {
            return Ok(None);
        }
        let mut matches = state
            .vms
            .iter()
            .filter(|(_, vm)| vm.name_label == name_label)
            .map(|(vm_ref, _)| vm_ref.clone());

        let found = matches.next();
        if matches.next().is_some() {
            return Err(VmOpsError::Session(format!(
                "duplicate name found: {}",
                name_label
            )));
        }
        Ok(found)
    }

    async fn set_vm_name_label(&self, vm: &VmRef, name_label: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::SetNameLabel {
            vm: vm.clone(),
            name: name_label.to_string(),
        });
        if state.fails(&FailPoint::SetNameLabel {
            name: name_label.to_string(),
        }) {
            return Err(injected("VM.set_name_label"));
        }
        state.vm_mut(vm)?.name_label = name_label.to_string();
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::DestroyVm { vm: vm.clone() });
        if state.fails(&FailPoint::DestroyVm) {
            return Err(injected("VM.destroy"));
        }
        state
            .vms
            .remove(vm)
            .map(|_| ())
            .ok_or_else(|| VmOpsError::NotFound(format!("VM {}", vm)))
    }

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState> {
        Ok(self.state().vm(vm)?.power)
    }

    async fn clean_shutdown_vm(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::CleanShutdown { vm: vm.clone() });
        if state.fails(&FailPoint::CleanShutdown) {
            return Err(injected("VM.clean_shutdown"));
        }
        let record = state.vm_mut(vm)?;
        record.power = PowerState::Halted;
        record.dom_id = -1;
        Ok(())
    }

    async fn hard_shutdown_vm(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::HardShutdown { vm: vm.clone() });
        if state.fails(&FailPoint::HardShutdown) {
            return Err(injected("VM.hard_shutdown"));
        }
        let record = state.vm_mut(vm)?;
        record.power = PowerState::Halted;
        record.dom_id = -1;
        Ok(())
    }

    async fn start_vm(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Start { vm: vm.clone() });
        if state.fails(&FailPoint::Start) {
            return Err(injected("VM.start"));
        }
        let needs_domain = state.vm(vm)?.dom_id < 0;
        let dom_id = if needs_domain {
            state.allocate_dom_id()
        } else {
            state.vm(vm)?.dom_id
        };
        let record = state.vm_mut(vm)?;
        record.power = PowerState::Running;
        record.dom_id = dom_id;
        Ok(())
    }

    async fn dom_id(&self, vm: &VmRef) -> Result<i64> {
        Ok(self.state().vm(vm)?.dom_id)
    }

    async fn root_disk(&self, vm: &VmRef) -> Result<DiskRef> {
        self.state()
            .vm(vm)?
            .root_disk
            .clone()
            .ok_or_else(|| VmOpsError::NotFound(format!("root disk of VM {}", vm)))
    }

    async fn disk_parent(&self, disk: &DiskRef) -> Result<Option<DiskRef>> {
        self.state()
            .disks
            .get(disk)
            .map(|record| record.parent.clone())
            .ok_or_else(|| VmOpsError::NotFound(format!("disk {}", disk)))
    }

    async fn snapshot_vm(&self, vm: &VmRef, label: &str) -> Result<SnapshotRef> {
        let mut state = self.state();
        state.calls.push(Call::Snapshot {
            vm: vm.clone(),
            label: label.to_string(),
        });
        if state.fails(&FailPoint::Snapshot) {
            return Err(injected("VM.snapshot"));
        }
        state.vm(vm)?;
        let snapshot = SnapshotRef::new(state.next_ref("snapshot"));
        state.snapshots.insert(snapshot.clone(), vm.clone());
        Ok(snapshot)
    }

    async fn destroy_snapshot(&self, snapshot: &SnapshotRef) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::DestroySnapshot {
            snapshot: snapshot.clone(),
        });
        if state.fails(&FailPoint::DestroySnapshot) {
            return Err(injected("VM.destroy snapshot"));
        }
        state
            .snapshots
            .remove(snapshot)
            .map(|_| ())
            .ok_or_else(|| VmOpsError::NotFound(format!("snapshot {}", snapshot)))
    }

    async fn resize_disk_copy(
        &self,
        _instance: &Instance,
        disk: &DiskRef,
        new_size_gb: u64,
    ) -> Result<DiskRef> {
        let mut state = self.state();
        state.calls.push(Call::ResizeDiskCopy {
            disk: disk.clone(),
            new_size_gb,
        });
        if state.fails(&FailPoint::ResizeDiskCopy) {
            return Err(injected("VDI.copy"));
        }
        if !state.disks.contains_key(disk) {
            return Err(VmOpsError::NotFound(format!("disk {}", disk)));
        }
        let copy = DiskRef::new(state.next_ref("vdi"));
        state.disks.insert(
            copy.clone(),
            FakeDisk {
                parent: None,
                size_gb: new_size_gb,
            },
        );
        Ok(copy)
    }

    async fn destroy_disk(&self, disk: &DiskRef) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::DestroyDisk { disk: disk.clone() });
        if state.fails(&FailPoint::DestroyDisk) {
            return Err(injected("VDI.destroy"));
        }
        state
            .disks
            .remove(disk)
            .map(|_| ())
            .ok_or_else(|| VmOpsError::NotFound(format!("disk {}", disk)))
    }

    async fn copy_disk(&self, transfer: &DiskTransfer) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::CopyDisk {
            disk: transfer.disk.clone(),
            destination: transfer.destination.clone(),
            sr_path: transfer.sr_path.clone(),
            seq_num: transfer.seq_num,
        });
        state.copies_attempted += 1;
        let nth = state.copies_attempted;
        if state.fails(&FailPoint::CopyDisk { nth }) {
            return Err(injected("migration.transfer_vhd"));
        }
        if !state.disks.contains_key(&transfer.disk) {
            return Err(VmOpsError::NotFound(format!("disk {}", transfer.disk)));
        }
        state.transfers.push(transfer.clone());
        Ok(())
    }

    async fn storage_repository_path(&self, _instance: &Instance) -> Result<String> {
        Ok(self.sr_path.clone())
    }

    async fn call_plugin(
        &self,
        plugin: &str,
        method: &str,
        _args: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.state();
        state.calls.push(Call::Plugin {
            plugin: plugin.to_string(),
            method: method.to_string(),
        });
        state.plugin_calls += 1;
        if state.fails(&FailPoint::Plugin) {
            return Err(injected("host.call_plugin"));
        }
        state
            .plugin_responses
            .get(&(plugin.to_string(), method.to_string()))
            .cloned()
            .ok_or_else(|| VmOpsError::Session(format!("no plugin {}.{}", plugin, method)))
    }

    async fn read_xenstore(&self, vm: &VmRef, key: &str) -> Result<Option<String>> {
        Ok(self.state().vm(vm)?.xenstore.get(key).cloned())
    }

    async fn write_xenstore(&self, vm: &VmRef, key: &str, value: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::WriteXenstore {
            vm: vm.clone(),
            key: key.to_string(),
            value: value.to_string(),
        });
        state
            .vm_mut(vm)?
            .xenstore
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_xenstore(&self, vm: &VmRef, key: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::RemoveXenstore {
            vm: vm.clone(),
            key: key.to_string(),
        });
        state.vm_mut(vm)?.xenstore.remove(key);
        Ok(())
    }

    async fn probe_is_pv(
        &self,
        disk: &DiskRef,
        _disk_type: Option<DiskType>,
        _os_type: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(Call::ProbeIsPv { disk: disk.clone() });
        Ok(state.pv_disks.contains(disk))
    }

    async fn attach_volume(&self, vm: &VmRef, mapping: &BlockDeviceMapping) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::AttachVolume {
            vm: vm.clone(),
            volume_id: mapping.volume_id.clone(),
        });
        state.vm_mut(vm)?.volumes.push(mapping.volume_id.clone());
        Ok(())
    }

    async fn detach_volume(&self, vm: &VmRef, mapping: &BlockDeviceMapping) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::DetachVolume {
            vm: vm.clone(),
            volume_id: mapping.volume_id.clone(),
        });
        let record = state.vm_mut(vm)?;
        let before = record.volumes.len();
        record.volumes.retain(|volume| *volume != mapping.volume_id);
        if record.volumes.len() == before {
            return Err(VmOpsError::NotFound(format!(
                "volume {} on VM {}",
                mapping.volume_id, vm
            )));
        }
        Ok(())
    }
}

/// A resize to run against the fake, as read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub instance: Instance,
    pub flavor: Flavor,
    #[serde(default = "default_destination")]
    pub destination: String,
    /// Disk chain of the VM, leaf first.
    pub chain: Vec<String>,
    #[serde(default = "default_running")]
    pub running: bool,
    #[serde(default)]
    pub failures: Vec<FailPoint>,
    #[serde(default)]
    pub block_devices: Vec<BlockDeviceMapping>,
}

fn default_destination() -> String {
    "dest-host".to_string()
}

fn default_running() -> bool {
    true
}

impl Scenario {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(contents)?;
        if scenario.chain.is_empty() {
            return Err(VmOpsError::Config(
                "scenario chain needs at least a leaf disk".to_string(),
            ));
        }
        Ok(scenario)
    }

    /// Populate a fresh fake with the scenario's VM, chain and failures.
    pub fn build(&self) -> Result<(FakeSession, VmRef)> {
        let session = FakeSession::new();
        let power = if self.running {
            PowerState::Running
        } else {
            PowerState::Halted
        };
        let vm = session.create_vm(&self.instance.name, power);

        let chain: Vec<&str> = self.chain.iter().map(String::as_str).collect();
        session.create_disk_chain(&vm, &chain, self.instance.root_gb)?;

        for mapping in &self.block_devices {
            session.attach_volume_directly(&vm, &mapping.volume_id)?;
        }
        for point in &self.failures {
            session.fail(point.clone());
        }
        Ok((session, vm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_parses_failures_and_defaults() {
        let scenario = Scenario::from_str(
            r#"
            chain = ["leaf", "parent"]
            failures = [{ copy_disk = { nth = 2 } }, "clean_shutdown"]

            [instance]
            name = "web-1"
            root_gb = 10

            [flavor]
            root_gb = 20
            "#,
        )
        .unwrap();

        assert_eq!(scenario.destination, "dest-host");
        assert!(scenario.running);
        assert_eq!(
            scenario.failures,
            vec![FailPoint::CopyDisk { nth: 2 }, FailPoint::CleanShutdown]
        );
        assert_eq!(scenario.flavor, Flavor::new(20, 0));
    }

    #[test]
    fn scenario_without_chain_is_rejected() {
        let err = Scenario::from_str(
            r#"
            chain = []
            [instance]
            name = "web-1"
            root_gb = 10
            [flavor]
            root_gb = 20
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, VmOpsError::Config(_)));
    }

    #[tokio::test]
    async fn lookup_rejects_duplicate_names() {
        let session = FakeSession::new();
        session.create_vm("dup", PowerState::Running);
        session.create_vm("dup", PowerState::Running);

        let err = session.lookup_vm("dup").await.unwrap_err();
        assert!(matches!(err, VmOpsError::Session(_)));
    }
}
