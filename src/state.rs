//! Pipeline state machine
//!
//! `PipelineState` is the single source of truth for "what happened" during
//! an installation attempt: the current status, the step cursor, an
//! append-only audit trail of step outcomes, the terminal error and any
//! secondary cleanup diagnostics.
//!
//! # Status Flow
//!
//! ```text
//! NotStarted ──> Running ──> Completed
//!     │             │
//!     │             ├──> Failed
//!     │             │
//!     │             └──> Cancelling ──> Cancelled
//!     │
//!     └──> Failed   (configuration rejected, nothing ran)
//! ```

use std::fmt;
use thiserror::Error;

use crate::error::{PipelineError, ResourceError};

/// Seconds since the UNIX epoch, 0 if the clock is before it
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStatus {
    NotStarted,
    Running,
    /// Cancellation observed, cleanup in progress
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is an allowed transition
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::NotStarted, Self::Running)
                | (Self::NotStarted, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelling)
                | (Self::Cancelling, Self::Cancelled)
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Running => "Running",
            Self::Cancelling => "Cancelling",
            Self::Completed => "Installation complete",
            Self::Failed => "Installation failed",
            Self::Cancelled => "Installation cancelled",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Rejected status transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: PipelineStatus },

    #[error("Invalid transition from {from} to {to}")]
    Invalid {
        from: PipelineStatus,
        to: PipelineStatus,
    },
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Skip predicate said the work was already done
    Skipped,
    Failed { reason: String },
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Skipped => "SKIPPED",
            Self::Failed { .. } => "FAILED",
        }
    }
}

/// One entry of the audit trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    pub outcome: StepOutcome,
    /// Seconds since the UNIX epoch
    pub timestamp: u64,
}

impl StepRecord {
    pub fn new(step: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            step: step.into(),
            outcome,
            timestamp: unix_timestamp(),
        }
    }
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.timestamp, self.outcome.label(), self.step)?;
        if let StepOutcome::Failed { reason } = &self.outcome {
            // Keep one record per line
            write!(f, ": {}", reason.replace('\n', " "))?;
        }
        Ok(())
    }
}

/// State of one pipeline run, mutated only by the pipeline
#[derive(Debug, Clone)]
pub struct PipelineState {
    status: PipelineStatus,
    cursor: usize,
    records: Vec<StepRecord>,
    error: Option<PipelineError>,
    diagnostics: Vec<ResourceError>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            status: PipelineStatus::NotStarted,
            cursor: 0,
            records: Vec::new(),
            error: None,
            diagnostics: Vec::new(),
        }
    }

    #[inline]
    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Index of the step currently (or last) being executed
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Append-only step audit trail
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Terminal error for Failed and Cancelled runs
    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    /// Secondary problems (cleanup failures) that did not decide the outcome
    pub fn diagnostics(&self) -> &[ResourceError] {
        &self.diagnostics
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn count(&self, pred: impl Fn(&StepOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn completed_count(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Completed))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Failed { .. }))
    }

    /// Human-readable one-paragraph summary
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}: {} step(s) completed, {} skipped, {} failed",
            self.status,
            self.completed_count(),
            self.count(|o| matches!(o, StepOutcome::Skipped)),
            self.failed_count(),
        );
        if let Some(err) = &self.error {
            summary.push_str(&format!(". {}", err));
        }
        if !self.diagnostics.is_empty() {
            let notes: Vec<String> = self.diagnostics.iter().map(ToString::to_string).collect();
            summary.push_str(&format!(" (cleanup: {})", notes.join("; ")));
        }
        summary
    }

    /// Move to `to` if the transition is allowed.
    pub fn transition_to(&mut self, to: PipelineStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.status });
        }
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn set_cursor(&mut self, index: usize) {
        self.cursor = index;
    }

    pub(crate) fn push_record(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub(crate) fn set_error(&mut self, error: PipelineError) {
        self.error = Some(error);
    }

    pub(crate) fn push_diagnostic(&mut self, diagnostic: ResourceError) {
        self.diagnostics.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = PipelineState::new();
        state.transition_to(PipelineStatus::Running).unwrap();
        state.transition_to(PipelineStatus::Completed).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_cancel_goes_through_cancelling() {
        let mut state = PipelineState::new();
        state.transition_to(PipelineStatus::Running).unwrap();
        let err = state.transition_to(PipelineStatus::Cancelled).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));

        state.transition_to(PipelineStatus::Cancelling).unwrap();
        state.transition_to(PipelineStatus::Cancelled).unwrap();
    }

    #[test]
    fn test_config_failure_skips_running() {
        let mut state = PipelineState::new();
        state.transition_to(PipelineStatus::Failed).unwrap();
        assert_eq!(state.status(), PipelineStatus::Failed);
    }

    #[test]
    fn test_cannot_leave_terminal_state() {
        for terminal in [
            PipelineStatus::Completed,
            PipelineStatus::Failed,
            PipelineStatus::Cancelled,
        ] {
            for to in [PipelineStatus::Running, PipelineStatus::Failed] {
                assert!(!terminal.can_transition_to(to));
            }
        }

        let mut state = PipelineState::new();
        state.transition_to(PipelineStatus::Failed).unwrap();
        let err = state.transition_to(PipelineStatus::Running).unwrap_err();
        assert!(matches!(err, TransitionError::FromTerminalState { .. }));
    }

    #[test]
    fn test_cannot_complete_without_running() {
        let mut state = PipelineState::new();
        assert!(state.transition_to(PipelineStatus::Completed).is_err());
        assert_eq!(state.status(), PipelineStatus::NotStarted);
    }

    #[test]
    fn test_record_display_is_single_line() {
        let record = StepRecord {
            step: "bootloader".into(),
            outcome: StepOutcome::Failed {
                reason: "grub-install failed\nno EFI dir".into(),
            },
            timestamp: 1_700_000_000,
        };
        assert_eq!(
            record.to_string(),
            "1700000000 FAILED bootloader: grub-install failed no EFI dir"
        );
    }

    #[test]
    fn test_summary_mentions_error_and_diagnostics() {
        let mut state = PipelineState::new();
        state.transition_to(PipelineStatus::Running).unwrap();
        state.push_record(StepRecord::new("format", StepOutcome::Completed));
        state.push_record(StepRecord::new(
            "mount",
            StepOutcome::Failed {
                reason: "busy".into(),
            },
        ));
        state.set_error(PipelineError::StepExecution {
            step: "mount".into(),
            cause: "busy".into(),
        });
        state.push_diagnostic(ResourceError::UnmountFailed {
            target: PathBuf::from("/mnt"),
            reason: "target is busy".into(),
        });
        state.transition_to(PipelineStatus::Failed).unwrap();

        let summary = state.summary();
        assert!(summary.starts_with("Installation failed: 1 step(s) completed, 0 skipped, 1 failed"));
        assert!(summary.contains("Step 'mount' failed"));
        assert!(summary.contains("cleanup: Failed to unmount /mnt"));
    }
}
