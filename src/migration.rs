//! Resize and cold migration of an instance's disks to another host.
//!
//! The source VM is renamed to `<name>-orig` and kept as the rollback anchor
//! until the resize is confirmed or reverted. If anything fails once that
//! anchor exists, registered undo actions run and the caller receives
//! [`VmOpsError::InstanceFaultRollback`] wrapping the original cause.

use crate::{
    Result, VmOpsError,
    chain::{self, ChainEvent, ChainTarget, SnapshotChain},
    instance::{BlockDeviceMapping, Flavor, Instance, RequestContext},
    log_debug, log_error, log_info, log_warn,
    resize::{ResizeDirection, check_resize},
    session::VmRef,
    undo::{UndoAction, UndoManager},
    vmops::VmOps,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Steps reported by the resize-down path, the last one belongs to the
/// destination host.
pub const RESIZE_DOWN_TOTAL_STEPS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Initial,
    OrigVmRenamed,
    DisksMigrating,
    DisksMigrated,
    Done,
    RolledBack,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::Initial => "initial",
            MigrationPhase::OrigVmRenamed => "orig-vm-renamed",
            MigrationPhase::DisksMigrating => "disks-migrating",
            MigrationPhase::DisksMigrated => "disks-migrated",
            MigrationPhase::Done => "done",
            MigrationPhase::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

struct PhaseTracker<'a> {
    instance: &'a str,
    phase: MigrationPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(instance: &'a Instance) -> Self {
        Self {
            instance: &instance.name,
            phase: MigrationPhase::Initial,
        }
    }

    fn advance(&mut self, next: MigrationPhase) {
        log_debug!("Migration of '{}': {} -> {}", self.instance, self.phase, next);
        self.phase = next;
    }

    fn current(&self) -> MigrationPhase {
        self.phase
    }
}

impl VmOps {
    /// Copy the instance's disks to `destination` and leave the source VM
    /// powered off under its `-orig` name.
    pub async fn migrate_disk_and_power_off(
        &self,
        context: &RequestContext,
        instance: &Instance,
        destination: &str,
        flavor: Flavor,
        block_devices: &[BlockDeviceMapping],
    ) -> Result<()> {
        let direction = check_resize(instance.allocation(), flavor)?;
        log_info!(
            "Migrating disks of '{}' to {} ({})",
            instance.name,
            destination,
            direction
        );

        let vm = self.get_vm_opaque_ref(instance, false).await?;
        let sr_path = self.session().storage_repository_path(instance).await?;
        let target = ChainTarget {
            instance,
            destination,
            sr_path: &sr_path,
            plugin: &self.config().plugins.migration,
        };

        let mut phase = PhaseTracker::new(instance);
        match direction {
            ResizeDirection::Up => {
                self.migrate_disk_resizing_up(context, target, &vm, &mut phase)
                    .await?
            }
            ResizeDirection::Down => {
                self.migrate_disk_resizing_down(context, target, flavor, &vm, &mut phase)
                    .await?
            }
        }

        self.detach_block_devices_from_orig_vm(instance, block_devices)
            .await?;
        phase.advance(MigrationPhase::Done);
        Ok(())
    }

    async fn migrate_disk_resizing_up(
        &self,
        context: &RequestContext,
        target: ChainTarget<'_>,
        vm: &VmRef,
        phase: &mut PhaseTracker<'_>,
    ) -> Result<()> {
        let instance = target.instance;

        self.apply_orig_vm_name_label(instance, vm).await?;
        phase.advance(MigrationPhase::OrigVmRenamed);

        let mut undo = UndoManager::new();
        undo.undo_with(UndoAction::RestoreOrigVm);

        match self.transfer_chain(context, target, vm, phase).await {
            Ok(()) => {
                phase.advance(MigrationPhase::DisksMigrated);
                Ok(())
            }
            Err(err) => Err(self.rollback(instance, undo, phase, err).await),
        }
    }

    async fn transfer_chain(
        &self,
        context: &RequestContext,
        target: ChainTarget<'_>,
        vm: &VmRef,
        phase: &mut PhaseTracker<'_>,
    ) -> Result<()> {
        let instance = target.instance;
        self.ensure_vm_is_shutdown(instance, vm).await?;
        phase.advance(MigrationPhase::DisksMigrating);

        let session = self.session();
        let progress = self.progress();
        let mut chain =
            SnapshotChain::acquire(session, instance, vm, &instance.snapshot_label()).await?;

        // Step 1 is the rename and shutdown; the destination owns the last step.
        let copied = chain::migrate_chain(session, &mut chain, target, |event| {
            let (step, len) = match event {
                ChainEvent::Walked { len } => (1, len),
                ChainEvent::Copied { copied, len } => (1 + copied, len),
            };
            progress.update_progress(context, instance, step, len + 2);
        })
        .await;

        let released = chain.release().await;
        match (copied, released) {
            (Ok(count), Ok(())) => {
                log_info!("Transferred {} disk(s) of '{}'", count, instance.name);
                Ok(())
            }
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(cleanup)) => {
                log_warn!("Failed to release snapshot chain: {}", cleanup);
                Err(err)
            }
        }
    }

    async fn migrate_disk_resizing_down(
        &self,
        context: &RequestContext,
        target: ChainTarget<'_>,
        flavor: Flavor,
        vm: &VmRef,
        phase: &mut PhaseTracker<'_>,
    ) -> Result<()> {
        let instance = target.instance;
        if !instance.auto_disk_config_enabled() {
            return Err(VmOpsError::Resize(
                "Resize down not allowed without auto_disk_config".to_string(),
            ));
        }

        let progress = self.progress();
        let report = |step: u32| {
            progress.update_progress(context, instance, step, RESIZE_DOWN_TOTAL_STEPS)
        };
        report(1);

        let mut undo = UndoManager::new();
        match self
            .shrink_and_transfer(target, flavor, vm, &mut undo, phase, &report)
            .await
        {
            Ok(()) => {
                phase.advance(MigrationPhase::DisksMigrated);
                Ok(())
            }
            Err(err) => Err(self.rollback(instance, undo, phase, err).await),
        }
    }

    async fn shrink_and_transfer(
        &self,
        target: ChainTarget<'_>,
        flavor: Flavor,
        vm: &VmRef,
        undo: &mut UndoManager,
        phase: &mut PhaseTracker<'_>,
        report: &(dyn Fn(u32) + Sync),
    ) -> Result<()> {
        let instance = target.instance;
        let session = self.session();

        self.ensure_vm_is_shutdown(instance, vm).await?;
        self.apply_orig_vm_name_label(instance, vm).await?;
        undo.undo_with(UndoAction::RestoreOrigVm);
        phase.advance(MigrationPhase::OrigVmRenamed);
        report(2);

        let root = session.root_disk(vm).await?;
        let copy = session
            .resize_disk_copy(instance, &root, flavor.root_gb)
            .await?;
        undo.undo_with(UndoAction::DestroyDisk(copy.clone()));
        report(3);

        phase.advance(MigrationPhase::DisksMigrating);
        chain::migrate_vhd(session, target, copy.clone(), 0).await?;
        session.destroy_disk(&copy).await?;
        report(4);

        Ok(())
    }

    async fn apply_orig_vm_name_label(&self, instance: &Instance, vm: &VmRef) -> Result<()> {
        let orig = instance.orig_name_label();
        log_debug!("Renaming VM '{}' to '{}'", instance.name, orig);
        self.session().set_vm_name_label(vm, &orig).await
    }

    async fn detach_block_devices_from_orig_vm(
        &self,
        instance: &Instance,
        block_devices: &[BlockDeviceMapping],
    ) -> Result<()> {
        if block_devices.is_empty() {
            return Ok(());
        }

        let orig = instance.orig_name_label();
        let vm = self
            .session()
            .lookup_vm(&orig)
            .await?
            .ok_or_else(|| VmOpsError::NotFound(format!("VM '{}'", orig)))?;

        for mapping in block_devices {
            log_debug!(
                "Detaching volume {} ({}) from '{}'",
                mapping.volume_id,
                mapping.mount_device,
                orig
            );
            self.session().detach_volume(&vm, mapping).await?;
        }
        Ok(())
    }

    /// Run the undo actions newest first and build the rollback fault.
    /// Best-effort cleanups are logged and skipped; a failed restore of the
    /// original VM is attached to the fault.
    async fn rollback(
        &self,
        instance: &Instance,
        undo: UndoManager,
        phase: &mut PhaseTracker<'_>,
        cause: VmOpsError,
    ) -> VmOpsError {
        let failed_in = phase.current();
        log_error!(
            "Migration of '{}' failed during {}: {}. Rolling back {} action(s)",
            instance.name,
            failed_in,
            cause,
            undo.len()
        );

        if undo.is_empty() {
            log_debug!("Nothing registered to undo for '{}'", instance.name);
        }

        let mut rollback_error = None;
        for action in undo.into_rollback_order() {
            let result = match &action {
                UndoAction::RestoreOrigVm => self.restore_orig_vm(instance).await,
                UndoAction::DestroyDisk(disk) => self.session().destroy_disk(disk).await,
            };

            let Err(err) = result else { continue };
            if action.is_best_effort() {
                log_warn!("Rollback step '{}' failed, continuing: {}", action, err);
            } else {
                log_error!("Rollback step '{}' failed: {}", action, err);
                if rollback_error.is_none() {
                    rollback_error = Some(Box::new(err));
                }
            }
        }

        phase.advance(MigrationPhase::RolledBack);
        VmOpsError::InstanceFaultRollback {
            instance: instance.name.clone(),
            phase: failed_in,
            source: Box::new(cause),
            rollback_error,
        }
    }
}
