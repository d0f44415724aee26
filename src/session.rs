//! Hypervisor control interface.
//!
//! Every remote operation the resize and recovery workflows perform goes
//! through [`XenSession`]. Calls are awaited one at a time; transport,
//! authentication and timeouts belong to the implementation and surface here
//! as ordinary errors.

use crate::{Result, instance::BlockDeviceMapping, instance::Instance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! opaque_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_ref!(
    /// Handle to a VM resident on one host.
    VmRef
);
opaque_ref!(
    /// Identifier of one disk (VDI) in a differencing chain.
    DiskRef
);
opaque_ref!(
    /// Handle to a transient snapshot VM exposing a disk chain.
    SnapshotRef
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Halted,
    Running,
    Paused,
    Suspended,
}

/// Image type of the disk being booted, used as a probe hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    Disk,
    DiskRaw,
    DiskVhd,
    DiskIso,
}

/// (major, minor, micro) as reported by the host software version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductVersion(pub u32, pub u32, pub u32);

/// One disk copy to a destination storage repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTransfer {
    /// Host plugin that receives the disk.
    pub plugin: String,
    pub instance_uuid: String,
    pub disk: DiskRef,
    pub destination: String,
    pub sr_path: String,
    /// 0 is the leaf (active) disk, ancestors count up from 1.
    pub seq_num: u32,
}

#[async_trait]
pub trait XenSession: Send + Sync {
    fn product_brand(&self) -> Option<String>;

    fn product_version(&self) -> Option<ProductVersion>;

    /// Find a VM by name label. `Ok(None)` when no VM carries that label.
    async fn lookup_vm(&self, name_label: &str) -> Result<Option<VmRef>>;

    async fn set_vm_name_label(&self, vm: &VmRef, name_label: &str) -> Result<()>;

    async fn destroy_vm(&self, vm: &VmRef) -> Result<()>;

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState>;

    async fn clean_shutdown_vm(&self, vm: &VmRef) -> Result<()>;

    async fn hard_shutdown_vm(&self, vm: &VmRef) -> Result<()>;

    async fn start_vm(&self, vm: &VmRef) -> Result<()>;

    async fn dom_id(&self, vm: &VmRef) -> Result<i64>;

    /// The active (leaf) disk backing the VM's root device.
    async fn root_disk(&self, vm: &VmRef) -> Result<DiskRef>;

    /// Parent of a disk in its differencing chain, `None` at the base.
    async fn disk_parent(&self, disk: &DiskRef) -> Result<Option<DiskRef>>;

    async fn snapshot_vm(&self, vm: &VmRef, label: &str) -> Result<SnapshotRef>;

    /// Destroy a snapshot VM together with the disks it owns.
    async fn destroy_snapshot(&self, snapshot: &SnapshotRef) -> Result<()>;

    /// Copy `disk` into a new disk of `new_size_gb`, shrinking the filesystem.
    async fn resize_disk_copy(
        &self,
        instance: &Instance,
        disk: &DiskRef,
        new_size_gb: u64,
    ) -> Result<DiskRef>;

    async fn destroy_disk(&self, disk: &DiskRef) -> Result<()>;

    async fn copy_disk(&self, transfer: &DiskTransfer) -> Result<()>;

    async fn storage_repository_path(&self, instance: &Instance) -> Result<String>;

    async fn call_plugin(
        &self,
        plugin: &str,
        method: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String>;

    async fn read_xenstore(&self, vm: &VmRef, key: &str) -> Result<Option<String>>;

    async fn write_xenstore(&self, vm: &VmRef, key: &str, value: &str) -> Result<()>;

    async fn remove_xenstore(&self, vm: &VmRef, key: &str) -> Result<()>;

    /// Inspect the disk's boot sector. `true` means a paravirtualized kernel.
    async fn probe_is_pv(
        &self,
        disk: &DiskRef,
        disk_type: Option<DiskType>,
        os_type: Option<&str>,
    ) -> Result<bool>;

    async fn attach_volume(&self, vm: &VmRef, mapping: &BlockDeviceMapping) -> Result<()>;

    async fn detach_volume(&self, vm: &VmRef, mapping: &BlockDeviceMapping) -> Result<()>;
}
