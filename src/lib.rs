pub mod chain;
pub mod config;
pub mod error;
pub mod fake;
pub mod instance;
pub mod logger;
pub mod migration;
pub mod progress;
pub mod recovery;
pub mod resize;
pub mod session;
pub mod undo;
pub mod vm_mode;
pub mod vmops;

pub use error::VmOpsError;
pub use instance::{BlockDeviceMapping, Flavor, Instance, RequestContext, TaskState};

pub type Result<T> = std::result::Result<T, VmOpsError>;

// Convenience re-exports for driver callers
pub use config::VmOpsConfig;
pub use migration::MigrationPhase;
pub use recovery::RevertOutcome;
pub use resize::{ResizeDirection, ResizeFunc, check_resize};
pub use session::{DiskRef, VmRef, XenSession};
pub use vm_mode::VmMode;
pub use vmops::VmOps;
