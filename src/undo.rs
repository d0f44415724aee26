use crate::session::DiskRef;
use std::fmt;

/// A compensating action registered while a resize makes progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Rename the `-orig` VM back to the instance name and boot it.
    RestoreOrigVm,
    /// Destroy an intermediate disk created on the source host.
    DestroyDisk(DiskRef),
}

impl UndoAction {
    /// Best-effort actions are logged and skipped when they fail.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, UndoAction::DestroyDisk(_))
    }
}

impl fmt::Display for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoAction::RestoreOrigVm => write!(f, "restore original VM"),
            UndoAction::DestroyDisk(disk) => write!(f, "destroy disk {}", disk),
        }
    }
}

/// Rollback context for one migration attempt.
#[derive(Debug, Default)]
pub struct UndoManager {
    actions: Vec<UndoAction>,
}

impl UndoManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn undo_with(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Registered actions, newest first.
    pub fn into_rollback_order(self) -> impl Iterator<Item = UndoAction> {
        self.actions.into_iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_runs_newest_first() {
        let mut undo = UndoManager::new();
        undo.undo_with(UndoAction::RestoreOrigVm);
        undo.undo_with(UndoAction::DestroyDisk(DiskRef::new("copy")));

        let order: Vec<_> = undo.into_rollback_order().collect();
        assert_eq!(
            order,
            vec![
                UndoAction::DestroyDisk(DiskRef::new("copy")),
                UndoAction::RestoreOrigVm
            ]
        );
        assert!(order[0].is_best_effort());
        assert!(!order[1].is_best_effort());
    }
}
