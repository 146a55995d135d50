//! Installation pipeline
//!
//! Drives the steps of a [`StepRegistry`] to completion, failure or
//! cancellation. The pipeline owns the [`MountLifecycle`] for the attempt
//! and releases it exactly once on every exit path after validation.
//!
//! ```text
//! validate ──(errors)──> Failed
//!    │
//!    └──> Running ── step 0 .. step n ──> release ──> Completed
//!            │            │
//!            │            └──(fatal failure)──> release ──> Failed
//!            │
//!            └──(cancel seen at a step boundary)──> Cancelling ──> release ──> Cancelled
//! ```

use std::any::Any;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::cancel::CancelToken;
use crate::config::InstallConfig;
use crate::devices::DeviceSet;
use crate::error::{InstallError, PipelineError};
use crate::mount::MountLifecycle;
use crate::progress::{Phase, ProgressEvent, ProgressReporter};
use crate::registry::StepRegistry;
use crate::state::{PipelineState, PipelineStatus, StepOutcome, StepRecord};

/// Name used for events that do not belong to a registry step
const CLEANUP: &str = "cleanup";
const VALIDATE: &str = "validate";

const WORKER_THREAD_NAME: &str = "install-pipeline";

pub struct InstallationPipeline {
    mounts: MountLifecycle,
    devices: DeviceSet,
    cancel: CancelToken,
    audit: Option<AuditLog>,
}

impl InstallationPipeline {
    /// `devices` is the snapshot the configuration is validated against
    pub fn new(mounts: MountLifecycle, devices: DeviceSet) -> Self {
        Self {
            mounts,
            devices,
            cancel: CancelToken::new(),
            audit: None,
        }
    }

    /// Record every step outcome to `log` as the run progresses
    pub fn with_audit_log(mut self, log: AuditLog) -> Self {
        self.audit = Some(log);
        self
    }

    /// Token that cancels this pipeline; clones share the flag
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.request();
    }

    pub fn mounts(&self) -> &MountLifecycle {
        &self.mounts
    }

    /// Run `registry` against `config`, reporting progress to `reporter`.
    ///
    /// Never panics on step failure and always returns a terminal state.
    #[tracing::instrument(
        skip_all,
        fields(
            target = %config.target_device.display(),
            profile = %config.profile,
            steps = registry.len(),
        )
    )]
    pub fn run<R>(
        &mut self,
        config: &InstallConfig,
        registry: &StepRegistry,
        reporter: &R,
    ) -> PipelineState
    where
        R: ProgressReporter + ?Sized,
    {
        let mut state = PipelineState::new();
        self.audit_begin(config);

        let problems = config.validate(&self.devices);
        if !problems.is_empty() {
            warn!("Configuration rejected with {} problem(s)", problems.len());
            let err = PipelineError::Configuration(problems);
            reporter.report(&ProgressEvent::new(VALIDATE, Phase::Failed, err.to_string()));
            state.set_error(err);
            return self.finish(state, PipelineStatus::Failed);
        }

        advance(&mut state, PipelineStatus::Running);
        info!("Starting installation on {}", config.target_device.display());

        for (index, step) in registry.steps().iter().enumerate() {
            state.set_cursor(index);

            if self.cancel.is_requested() {
                info!("Cancellation observed before step '{}'", step.name());
                reporter.report(&ProgressEvent::new(
                    step.name(),
                    Phase::Warning,
                    "Cancelled before start",
                ));
                advance(&mut state, PipelineStatus::Cancelling);
                self.cleanup(&mut state, reporter);
                state.set_error(PipelineError::CancelledByUser);
                return self.finish(state, PipelineStatus::Cancelled);
            }

            let description = step.kind().map(|k| k.description()).unwrap_or_default();
            reporter.report(&ProgressEvent::new(step.name(), Phase::Starting, description));

            if step.should_skip(config, &self.mounts) {
                info!("Skipping '{}': already done", step.name());
                self.record(&mut state, StepRecord::new(step.name(), StepOutcome::Skipped));
                reporter.report(&ProgressEvent::new(step.name(), Phase::Skipped, "Already done"));
                continue;
            }

            match step.run(config, &mut self.mounts) {
                Ok(()) => {
                    self.record(&mut state, StepRecord::new(step.name(), StepOutcome::Completed));
                    reporter.report(&ProgressEvent::new(step.name(), Phase::Completed, ""));
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    self.record(
                        &mut state,
                        StepRecord::new(
                            step.name(),
                            StepOutcome::Failed {
                                reason: reason.clone(),
                            },
                        ),
                    );

                    if step.is_fatal() {
                        error!("Step '{}' failed: {}", step.name(), reason);
                        reporter.report(&ProgressEvent::new(step.name(), Phase::Failed, reason));
                        self.cleanup(&mut state, reporter);
                        state.set_error(PipelineError::step(step.name(), &e));
                        return self.finish(state, PipelineStatus::Failed);
                    }

                    warn!("Recoverable step '{}' failed: {}", step.name(), reason);
                    reporter.report(&ProgressEvent::new(step.name(), Phase::Warning, reason));
                }
            }
        }

        self.cleanup(&mut state, reporter);
        self.finish(state, PipelineStatus::Completed)
    }

    /// Run on a dedicated worker thread.
    ///
    /// # Errors
    ///
    /// `Io` if the thread could not be spawned.
    pub fn spawn<R>(
        mut self,
        config: InstallConfig,
        registry: StepRegistry,
        reporter: R,
    ) -> Result<PipelineWorker, InstallError>
    where
        R: ProgressReporter + 'static,
    {
        let cancel = self.cancel_token();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || self.run(&config, &registry, &reporter))?;
        Ok(PipelineWorker { handle, cancel })
    }

    /// Release the mount point; failures become diagnostics
    fn cleanup<R>(&mut self, state: &mut PipelineState, reporter: &R)
    where
        R: ProgressReporter + ?Sized,
    {
        if let Err(e) = self.mounts.release() {
            warn!("Cleanup failed: {}", e);
            reporter.report(&ProgressEvent::new(CLEANUP, Phase::Warning, e.to_string()));
            state.push_diagnostic(e);
        }
    }

    fn record(&mut self, state: &mut PipelineState, record: StepRecord) {
        if let Some(log) = &mut self.audit {
            if let Err(e) = log.append(&record) {
                warn!("Audit log write to {} failed: {}", log.path().display(), e);
            }
        }
        state.push_record(record);
    }

    fn audit_begin(&mut self, config: &InstallConfig) {
        if let Some(log) = &mut self.audit {
            let line = format!(
                "attempt target={} profile={}",
                config.target_device.display(),
                config.profile
            );
            if let Err(e) = log.begin(&line) {
                warn!("Audit log write to {} failed: {}", log.path().display(), e);
            }
        }
    }

    fn finish(&mut self, mut state: PipelineState, status: PipelineStatus) -> PipelineState {
        advance(&mut state, status);
        info!("{}", state.summary());
        if let Some(log) = &mut self.audit {
            if let Err(e) = log.finish(&state) {
                warn!("Audit log write to {} failed: {}", log.path().display(), e);
            }
        }
        state
    }
}

fn advance(state: &mut PipelineState, to: PipelineStatus) {
    if let Err(e) = state.transition_to(to) {
        error!("Pipeline state machine: {}", e);
    }
}

/// Handle to a pipeline running on its worker thread
pub struct PipelineWorker {
    handle: JoinHandle<PipelineState>,
    cancel: CancelToken,
}

impl PipelineWorker {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop at the next step boundary
    pub fn request_cancel(&self) {
        self.cancel.request();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the terminal state.
    ///
    /// # Errors
    ///
    /// `WorkerPanicked` if a step action panicked.
    pub fn join(self) -> Result<PipelineState, InstallError> {
        self.handle
            .join()
            .map_err(|payload| InstallError::WorkerPanicked(panic_message(payload.as_ref())))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
