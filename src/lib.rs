//! install-pipeline library
//!
//! Orchestration core of an Arch Linux installer: a validated, immutable
//! configuration, a static per-profile step registry, and a pipeline that
//! drives the steps on a worker thread while guaranteeing the target mount
//! point is released on every exit path.

pub mod audit;
pub mod backend;
pub mod cancel;
pub mod cli;
pub mod command;
pub mod config;
pub mod devices;
pub mod error;
pub mod mount;
pub mod pipeline;
pub mod process_guard;
pub mod progress;
pub mod registry;
pub mod sanity;
pub mod state;
pub mod step;
pub mod types;

// Re-export main types for convenience
pub use audit::AuditLog;
pub use backend::{CommandBackend, InstallerBackend};
pub use cancel::CancelToken;
pub use command::{disable_dry_run, enable_dry_run, is_dry_run};
pub use config::{InstallConfig, Secret, UserAccount, ValidationError};
pub use devices::{BlockDevice, DeviceSet};
pub use error::{InstallError, PipelineError, RegistryError, ResourceError};
pub use mount::{MountBackend, MountHandle, MountLayout, MountLifecycle, MountState, SystemMount};
pub use pipeline::{InstallationPipeline, PipelineWorker};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use progress::{Phase, ProgressEvent, ProgressReporter};
pub use registry::StepRegistry;
pub use state::{PipelineState, PipelineStatus, StepOutcome, StepRecord};
pub use step::{Severity, Step, StepAction, StepKind};
pub use types::{Bootloader, Feature, Filesystem, Profile};
