use crate::migration::MigrationPhase;

#[derive(Debug, thiserror::Error)]
pub enum VmOpsError {
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Instance '{instance}' faulted during {phase} and was rolled back: {source}")]
    InstanceFaultRollback {
        instance: String,
        phase: MigrationPhase,
        #[source]
        source: Box<VmOpsError>,
        rollback_error: Option<Box<VmOpsError>>,
    },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Resize error: {0}")]
    Resize(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid VM mode: {0}")]
    InvalidVmMode(String),

    #[error("Hypervisor session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Serde(String),
}

impl VmOpsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmOpsError::NotFound(_))
    }

    /// The underlying cause of a rollback fault, or the error itself.
    pub fn root_cause(&self) -> &VmOpsError {
        match self {
            VmOpsError::InstanceFaultRollback { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<toml::de::Error> for VmOpsError {
    fn from(err: toml::de::Error) -> Self {
        VmOpsError::Serde(err.to_string())
    }
}

impl From<toml::ser::Error> for VmOpsError {
    fn from(err: toml::ser::Error) -> Self {
        VmOpsError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for VmOpsError {
    fn from(err: serde_json::Error) -> Self {
        VmOpsError::Serde(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_fault_keeps_original_cause() {
        let err = VmOpsError::InstanceFaultRollback {
            instance: "fake".into(),
            phase: MigrationPhase::DisksMigrating,
            source: Box::new(VmOpsError::Migration("transfer failed".into())),
            rollback_error: None,
        };

        assert!(matches!(err.root_cause(), VmOpsError::Migration(_)));
        let printed = err.to_string();
        assert!(printed.contains("fake"));
        assert!(printed.contains("transfer failed"));
    }
}
