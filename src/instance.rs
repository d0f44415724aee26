use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Progress marker owned by the compute manager. Read here, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    ResizePrep,
    ResizeMigrating,
    ResizeMigrated,
    ResizeFinish,
    ResizeReverting,
    ResizeConfirming,
    Rebooting,
    Rescuing,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::ResizePrep => "resize_prep",
            TaskState::ResizeMigrating => "resize_migrating",
            TaskState::ResizeMigrated => "resize_migrated",
            TaskState::ResizeFinish => "resize_finish",
            TaskState::ResizeReverting => "resize_reverting",
            TaskState::ResizeConfirming => "resize_confirming",
            TaskState::Rebooting => "rebooting",
            TaskState::Rescuing => "rescuing",
        };
        f.write_str(name)
    }
}

/// Disk allocation of an instance or a requested flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flavor {
    pub root_gb: u64,
    #[serde(default)]
    pub ephemeral_gb: u64,
}

impl Flavor {
    pub fn new(root_gb: u64, ephemeral_gb: u64) -> Self {
        Self {
            root_gb,
            ephemeral_gb,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub task_state: Option<TaskState>,
    pub root_gb: u64,
    #[serde(default)]
    pub ephemeral_gb: u64,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub vm_mode: Option<String>,
    #[serde(default)]
    pub auto_disk_config: Option<bool>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Instance {
    pub fn new(name: impl Into<String>, root_gb: u64, ephemeral_gb: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            task_state: None,
            root_gb,
            ephemeral_gb,
            os_type: None,
            vm_mode: None,
            auto_disk_config: None,
            hostname: None,
        }
    }

    pub fn allocation(&self) -> Flavor {
        Flavor::new(self.root_gb, self.ephemeral_gb)
    }

    /// Name label of the VM preserved on the source host during a resize.
    pub fn orig_name_label(&self) -> String {
        format!("{}-orig", self.name)
    }

    pub fn rescue_name_label(&self) -> String {
        format!("{}-rescue", self.name)
    }

    pub fn snapshot_label(&self) -> String {
        format!("{}-snapshot", self.name)
    }

    pub fn auto_disk_config_enabled(&self) -> bool {
        self.auto_disk_config.unwrap_or(false)
    }

    pub fn is_windows(&self) -> bool {
        self.os_type.as_deref() == Some("windows")
    }
}

/// A volume attached to the instance through the block device layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub mount_device: String,
    pub volume_id: String,
    #[serde(default)]
    pub connection_info: serde_json::Value,
}

/// Per-request context handed through to progress reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: format!("req-{}", Uuid::new_v4()),
            user_id: None,
            project_id: None,
            timestamp: Utc::now(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
