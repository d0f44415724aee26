//! Reverting a resize, safe to repeat after a crash.
//!
//! Progress is never remembered in-process. Each call looks at which of the
//! two VMs exist on the host, `<name>-orig` (the preserved original) and
//! `<name>` (a new VM, or the original already renamed back), and finishes
//! whatever is left from that point.

use crate::{
    Result, VmOpsError,
    instance::{BlockDeviceMapping, Instance},
    log_debug, log_info, log_warn,
    session::{PowerState, VmRef},
    vmops::VmOps,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertOutcome {
    /// The `-orig` VM was renamed back and started.
    RestoredFromBackup { destroyed_stray: bool },
    /// A previous attempt already renamed it back; it was only started.
    AlreadyRestored,
    /// Neither VM exists. Nothing was started.
    NothingToRecover,
}

impl VmOps {
    pub async fn finish_revert_migration(
        &self,
        instance: &Instance,
        block_devices: &[BlockDeviceMapping],
    ) -> Result<RevertOutcome> {
        self.restore_orig_vm_and_cleanup_orphan(instance, block_devices)
            .await
    }

    /// Rollback of a failed migration. Unlike a revert, the `-orig` VM must
    /// still exist: without it there is nothing to put back.
    pub(crate) async fn restore_orig_vm(&self, instance: &Instance) -> Result<()> {
        let orig = instance.orig_name_label();
        if self.session().lookup_vm(&orig).await?.is_none() {
            return Err(VmOpsError::NotFound(format!(
                "VM '{}' to restore for instance '{}'",
                orig, instance.name
            )));
        }

        self.restore_orig_vm_and_cleanup_orphan(instance, &[])
            .await
            .map(|_| ())
    }

    async fn restore_orig_vm_and_cleanup_orphan(
        &self,
        instance: &Instance,
        block_devices: &[BlockDeviceMapping],
    ) -> Result<RevertOutcome> {
        let session = self.session();
        let backup = session.lookup_vm(&instance.orig_name_label()).await?;
        let live = session.lookup_vm(&instance.name).await?;

        let (vm, outcome) = match (backup, live) {
            (Some(backup), live) => {
                let stray = live.filter(|vm| *vm != backup);
                if let Some(stray) = &stray {
                    log_info!("Destroying new VM '{}' left on the source host", instance.name);
                    self.destroy_stray_vm(stray).await?;
                }

                session.set_vm_name_label(&backup, &instance.name).await?;
                self.attach_mapped_block_devices(&backup, block_devices)
                    .await?;
                let outcome = RevertOutcome::RestoredFromBackup {
                    destroyed_stray: stray.is_some(),
                };
                (backup, outcome)
            }
            (None, Some(live)) => {
                log_debug!("'{}' already restored, starting it", instance.name);
                (live, RevertOutcome::AlreadyRestored)
            }
            (None, None) => {
                log_warn!(
                    "Neither '{}' nor '{}' exists, nothing to revert",
                    instance.name,
                    instance.orig_name_label()
                );
                return Ok(RevertOutcome::NothingToRecover);
            }
        };

        session.start_vm(&vm).await?;
        log_info!("Reverted '{}' ({:?})", instance.name, outcome);
        Ok(outcome)
    }

    async fn destroy_stray_vm(&self, vm: &VmRef) -> Result<()> {
        let session = self.session();
        if session.power_state(vm).await? != PowerState::Halted {
            session.hard_shutdown_vm(vm).await?;
        }
        session.destroy_vm(vm).await
    }

    async fn attach_mapped_block_devices(
        &self,
        vm: &VmRef,
        block_devices: &[BlockDeviceMapping],
    ) -> Result<()> {
        for mapping in block_devices {
            log_debug!(
                "Attaching volume {} at {}",
                mapping.volume_id,
                mapping.mount_device
            );
            self.session().attach_volume(vm, mapping).await?;
        }
        Ok(())
    }
}
