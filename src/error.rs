//! Error handling module for the installation pipeline
//!
//! Provides the typed error taxonomy using thiserror. Step actions and
//! command plumbing use `anyhow` for their underlying causes; everything the
//! pipeline surfaces to a caller is one of the types below.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ValidationError;

/// Errors raised by the mount lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Another live `MountLifecycle` already claims this mount point
    #[error("Mount point {} is already owned by another installation attempt", .0.display())]
    MountPointInUse(PathBuf),

    /// `acquire` called while a handle is still live
    #[error("Mount point {} is already mounted (device {})", target.display(), device.display())]
    AlreadyMounted { target: PathBuf, device: PathBuf },

    /// The mount command failed; state was returned to Unmounted
    #[error("Failed to mount {} on {}: {reason}", device.display(), target.display())]
    MountFailed {
        device: PathBuf,
        target: PathBuf,
        reason: String,
    },

    /// The unmount command failed
    #[error("Failed to unmount {}: {reason}", target.display())]
    UnmountFailed { target: PathBuf, reason: String },
}

/// Terminal error carried by a failed or cancelled pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Pre-flight validation failed; no step ran and nothing was mounted
    #[error("Configuration error: {}", format_validation(.0))]
    Configuration(Vec<ValidationError>),

    /// A fatal step failed
    #[error("Step '{step}' failed: {cause}")]
    StepExecution { step: String, cause: String },

    /// Mount or unmount failed outside of a step
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// The front-end requested cancellation
    #[error("Installation cancelled by user")]
    CancelledByUser,
}

impl PipelineError {
    /// Create a step execution error from any displayable cause.
    ///
    /// `anyhow` chains are flattened with `{:#}` so the root cause survives.
    pub fn step(step: impl Into<String>, cause: &anyhow::Error) -> Self {
        Self::StepExecution {
            step: step.into(),
            cause: format!("{:#}", cause),
        }
    }

    /// Name of the failing step, if this is a step error
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::StepExecution { step, .. } => Some(step),
            _ => None,
        }
    }
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while building a step registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Step '{0}' is declared more than once")]
    DuplicateStep(String),

    #[error("Step '{step}' ({kind}) cannot run after a {previous} step")]
    OutOfOrder {
        step: String,
        kind: crate::step::StepKind,
        previous: crate::step::StepKind,
    },
}

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum InstallError {
    /// IO errors (config files, audit log, terminal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The dedicated worker thread panicked
    #[error("Installation worker panicked: {0}")]
    WorkerPanicked(String),

    /// Environment pre-flight failed
    #[error("Pre-flight check failed: {0}")]
    Preflight(String),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, InstallError>;
