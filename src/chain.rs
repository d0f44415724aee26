//! Differencing-disk chains and the copy of a chain to another host.
//!
//! A chain is exposed by snapshotting the VM and walking parent links from
//! the active disk. [`SnapshotChain`] owns the transient snapshot for the
//! length of one walk: callers must [`SnapshotChain::release`] it on every
//! exit path. It is consumed as it is read and cannot be restarted; a new
//! walk needs a new snapshot.

use crate::{
    Result, VmOpsError,
    instance::Instance,
    log_debug, log_info, log_warn,
    session::{DiskRef, DiskTransfer, SnapshotRef, VmRef, XenSession},
};
use std::collections::HashSet;

pub struct SnapshotChain<'a> {
    session: &'a dyn XenSession,
    snapshot: Option<SnapshotRef>,
    next: Option<DiskRef>,
    seen: HashSet<DiskRef>,
}

impl<'a> SnapshotChain<'a> {
    /// Snapshot `vm` under `label` and position the walk at its leaf disk.
    pub async fn acquire(
        session: &'a dyn XenSession,
        instance: &Instance,
        vm: &VmRef,
        label: &str,
    ) -> Result<SnapshotChain<'a>> {
        log_debug!("Snapshotting VM '{}' as '{}'", instance.name, label);
        let snapshot = session.snapshot_vm(vm, label).await?;

        let leaf = match session.root_disk(vm).await {
            Ok(leaf) => leaf,
            Err(err) => {
                if let Err(cleanup) = session.destroy_snapshot(&snapshot).await {
                    log_warn!("Failed to destroy snapshot {}: {}", snapshot, cleanup);
                }
                return Err(err);
            }
        };

        Ok(SnapshotChain {
            session,
            snapshot: Some(snapshot),
            next: Some(leaf),
            seen: HashSet::new(),
        })
    }

    /// Next disk, leaf first then ancestors nearest-first.
    pub async fn next_disk(&mut self) -> Result<Option<DiskRef>> {
        let Some(current) = self.next.take() else {
            return Ok(None);
        };

        if !self.seen.insert(current.clone()) {
            return Err(VmOpsError::Driver(format!(
                "differencing chain loops back to disk {}",
                current
            )));
        }

        self.next = self.session.disk_parent(&current).await?;
        Ok(Some(current))
    }

    /// Destroy the snapshot that exposed the chain.
    pub async fn release(mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            log_debug!("Destroying snapshot {}", snapshot);
            self.session.destroy_snapshot(&snapshot).await?;
        }
        Ok(())
    }
}

impl Drop for SnapshotChain<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = &self.snapshot {
            log_warn!("Snapshot {} dropped without being released", snapshot);
        }
    }
}

/// Where a chain is being copied to.
#[derive(Debug, Clone, Copy)]
pub struct ChainTarget<'a> {
    pub instance: &'a Instance,
    pub destination: &'a str,
    pub sr_path: &'a str,
    pub plugin: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    /// The chain has been walked; `len` disks will be copied.
    Walked { len: u32 },
    /// `copied` of `len` disks are at the destination.
    Copied { copied: u32, len: u32 },
}

/// Copy every disk of `chain` to the destination.
///
/// Ancestors go first, in the order walked, with sequence numbers from 1.
/// The leaf goes last with sequence number 0, once all of its parents exist
/// at the destination. Copies are strictly sequential. The first failed copy
/// aborts the walk; already-copied disks are left for the caller to handle.
pub async fn migrate_chain<F>(
    session: &dyn XenSession,
    chain: &mut SnapshotChain<'_>,
    target: ChainTarget<'_>,
    mut on_event: F,
) -> Result<u32>
where
    F: FnMut(ChainEvent),
{
    let Some(leaf) = chain.next_disk().await? else {
        return Err(VmOpsError::NotFound(format!(
            "root disk for instance '{}'",
            target.instance.name
        )));
    };

    let mut ancestors = Vec::new();
    while let Some(disk) = chain.next_disk().await? {
        ancestors.push(disk);
    }

    let len = ancestors.len() as u32 + 1;
    on_event(ChainEvent::Walked { len });

    let mut copied = 0;
    for (index, disk) in ancestors.into_iter().enumerate() {
        migrate_vhd(session, target, disk, index as u32 + 1).await?;
        copied += 1;
        on_event(ChainEvent::Copied { copied, len });
    }

    migrate_vhd(session, target, leaf, 0).await?;
    copied += 1;
    on_event(ChainEvent::Copied { copied, len });

    Ok(copied)
}

pub(crate) async fn migrate_vhd(
    session: &dyn XenSession,
    target: ChainTarget<'_>,
    disk: DiskRef,
    seq_num: u32,
) -> Result<()> {
    log_info!(
        "Migrating VHD '{}' with seq_num {} for instance '{}'",
        disk,
        seq_num,
        target.instance.name
    );

    let transfer = DiskTransfer {
        plugin: target.plugin.to_string(),
        instance_uuid: target.instance.uuid.to_string(),
        disk,
        destination: target.destination.to_string(),
        sr_path: target.sr_path.to_string(),
        seq_num,
    };

    session.copy_disk(&transfer).await.map_err(|err| {
        VmOpsError::Migration(format!(
            "Failed to transfer vhd {} to new host: {}",
            transfer.disk, err
        ))
    })
}
