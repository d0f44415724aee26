use crate::{
    Result, VmOpsError,
    instance::Instance,
    log_debug,
    session::{DiskRef, DiskType, XenSession},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmMode {
    /// Paravirtualized guest.
    Xen,
    /// Hardware-virtualized guest.
    Hvm,
}

impl VmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmMode::Xen => "xen",
            VmMode::Hvm => "hvm",
        }
    }

    /// Canonicalise the mode stored on the instance.
    ///
    /// Legacy spellings (`pv`, `hv`, `baremetal`) are accepted. Modes this
    /// driver does not boot (`uml`, `exe`) yield `None` so the caller probes.
    pub fn from_instance(instance: &Instance) -> Result<Option<VmMode>> {
        let Some(raw) = instance.vm_mode.as_deref() else {
            return Ok(None);
        };

        match raw.trim().to_lowercase().as_str() {
            "xen" | "pv" => Ok(Some(VmMode::Xen)),
            "hvm" | "hv" | "baremetal" => Ok(Some(VmMode::Hvm)),
            "uml" | "exe" => Ok(None),
            other => Err(VmOpsError::InvalidVmMode(other.to_string())),
        }
    }
}

impl fmt::Display for VmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskRole {
    Root,
    Ephemeral,
    Swap,
    Iso,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub disk: DiskRef,
}

impl DiskInfo {
    pub fn new(disk: impl Into<DiskRef>) -> Self {
        Self { disk: disk.into() }
    }
}

/// Decide how the VM boots: explicit instance metadata first, then HVM when
/// there is no root disk (ISO boot), otherwise probe the root disk.
pub async fn determine_vm_mode(
    session: &dyn XenSession,
    instance: &Instance,
    disks: Option<&HashMap<DiskRole, DiskInfo>>,
    disk_type: Option<DiskType>,
) -> Result<VmMode> {
    if let Some(mode) = VmMode::from_instance(instance)? {
        return Ok(mode);
    }

    let Some(root) = disks.and_then(|disks| disks.get(&DiskRole::Root)) else {
        log_debug!("No root disk for '{}', defaulting to HVM", instance.name);
        return Ok(VmMode::Hvm);
    };

    let is_pv = session
        .probe_is_pv(&root.disk, disk_type, instance.os_type.as_deref())
        .await?;

    Ok(if is_pv { VmMode::Xen } else { VmMode::Hvm })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_with_mode(mode: Option<&str>) -> Instance {
        let mut instance = Instance::new("foo", 1, 0);
        instance.vm_mode = mode.map(str::to_string);
        instance
    }

    #[test]
    fn canonicalises_legacy_spellings() {
        for (raw, expected) in [
            ("xen", VmMode::Xen),
            ("PV", VmMode::Xen),
            ("hvm", VmMode::Hvm),
            ("hv", VmMode::Hvm),
            ("baremetal", VmMode::Hvm),
        ] {
            let instance = instance_with_mode(Some(raw));
            assert_eq!(VmMode::from_instance(&instance).unwrap(), Some(expected));
        }
    }

    #[test]
    fn foreign_and_missing_modes_defer_to_probe() {
        assert_eq!(VmMode::from_instance(&instance_with_mode(None)).unwrap(), None);
        assert_eq!(
            VmMode::from_instance(&instance_with_mode(Some("uml"))).unwrap(),
            None
        );
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let err = VmMode::from_instance(&instance_with_mode(Some("qemu"))).unwrap_err();
        assert!(matches!(err, VmOpsError::InvalidVmMode(mode) if mode == "qemu"));
    }
}
