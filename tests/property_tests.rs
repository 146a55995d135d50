//! Property-based tests for the pipeline invariants
//!
//! Registries are generated with arbitrary lengths, failure positions and
//! cancellation points; the pipeline must uphold its ordering, cleanup and
//! audit-trail guarantees for all of them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use install_pipeline::config::check_hostname;
use install_pipeline::{
    DeviceSet, InstallConfig, InstallationPipeline, MountBackend, MountLayout, MountLifecycle,
    MountState, Phase, PipelineStatus, ProgressEvent, ProgressReporter, Secret, Severity, Step,
    StepRegistry, UserAccount,
};
use proptest::prelude::*;

#[derive(Default)]
struct CountingMount {
    unmounts: AtomicUsize,
}

impl MountBackend for CountingMount {
    fn mount(&self, _: &MountLayout, _: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn unmount(&self, _: &Path) -> anyhow::Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Started(Mutex<Vec<String>>);

impl ProgressReporter for Started {
    fn report(&self, event: &ProgressEvent) {
        if event.phase == Phase::Starting {
            self.0.lock().unwrap().push(event.step.clone());
        }
    }
}

fn valid_config() -> InstallConfig {
    InstallConfig {
        target_device: PathBuf::from("/dev/sdX"),
        users: vec![UserAccount::new("alice", Secret::Plain("pw".into()), true)],
        ..InstallConfig::default()
    }
}

fn lifecycle(name: &str) -> (MountLifecycle, Arc<CountingMount>) {
    let backend = Arc::new(CountingMount::default());
    let target = std::env::temp_dir().join(format!("pipeline-prop-{}", name));
    (MountLifecycle::new(target, backend.clone()).unwrap(), backend)
}

/// `len` steps; step 0 mounts, step `fail_at` (if any) fails
fn registry(len: usize, fail_at: Option<usize>, severity: Severity) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for i in 0..len {
        let fails = fail_at == Some(i);
        let step = Step::new(format!("step-{}", i), severity, move |_, mounts| {
            if i == 0 {
                mounts.acquire(&MountLayout::new("/dev/sdX2"))?;
            }
            if fails {
                bail!("step {} failed", i);
            }
            Ok(())
        });
        registry.push(step).unwrap();
    }
    registry
}

proptest! {
    /// A failing fatal step is the last step that ever starts, and the
    /// mount is released exactly once.
    #[test]
    fn fatal_failure_stops_everything_after_it(
        (len, fail_at) in (1usize..10).prop_flat_map(|len| (Just(len), 0..len))
    ) {
        let (mounts, backend) = lifecycle("fatal");
        let mut pipeline = InstallationPipeline::new(mounts, DeviceSet::from_paths(["/dev/sdX"]));
        let started = Started::default();

        let state = pipeline.run(&valid_config(), &registry(len, Some(fail_at), Severity::Fatal), &started);

        prop_assert_eq!(state.status(), PipelineStatus::Failed);
        let started = started.0.lock().unwrap().clone();
        prop_assert_eq!(started.len(), fail_at + 1);
        prop_assert_eq!(started.last().cloned(), Some(format!("step-{}", fail_at)));
        prop_assert_eq!(state.completed_count(), fail_at);
        prop_assert_eq!(state.failed_count(), 1);
        // step-0 mounts before it can fail, so there is always one release
        prop_assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
        prop_assert_eq!(pipeline.mounts().state(), MountState::Unmounted);
    }

    /// Recoverable failures never stop the run.
    #[test]
    fn recoverable_failure_runs_every_step(
        (len, fail_at) in (1usize..10).prop_flat_map(|len| (Just(len), 0..len))
    ) {
        let (mounts, _) = lifecycle("recoverable");
        let mut pipeline = InstallationPipeline::new(mounts, DeviceSet::from_paths(["/dev/sdX"]));
        let started = Started::default();

        let state = pipeline.run(&valid_config(), &registry(len, Some(fail_at), Severity::Recoverable), &started);

        prop_assert_eq!(state.status(), PipelineStatus::Completed);
        prop_assert_eq!(started.0.lock().unwrap().len(), len);
        prop_assert_eq!(state.records().len(), len);
        prop_assert_eq!(state.failed_count(), 1);
    }

    /// Cancelling during step i leaves exactly i completed records.
    #[test]
    fn cancel_during_step_i_keeps_i_records(
        (len, cancel_in) in (1usize..10).prop_flat_map(|len| (Just(len), 1..=len))
    ) {
        let (mounts, backend) = lifecycle("cancel");
        let mut pipeline = InstallationPipeline::new(mounts, DeviceSet::from_paths(["/dev/sdX"]));
        let token = pipeline.cancel_token();

        let mut registry = StepRegistry::new();
        for i in 1..=len {
            let token = token.clone();
            registry.push(Step::fatal(format!("step-{}", i), move |_, mounts| {
                if i == 1 {
                    mounts.acquire(&MountLayout::new("/dev/sdX2"))?;
                }
                if i == cancel_in {
                    token.request();
                }
                Ok(())
            })).unwrap();
        }

        let state = pipeline.run(&valid_config(), &registry, &Started::default());

        // Cancelling during the last step has nothing left to stop
        let expected = if cancel_in == len { PipelineStatus::Completed } else { PipelineStatus::Cancelled };
        prop_assert_eq!(state.status(), expected);
        prop_assert_eq!(state.completed_count(), cancel_in);
        prop_assert_eq!(state.records().len(), cancel_in);
        prop_assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
    }

    /// Invalid configurations never start a step or mount anything.
    #[test]
    fn invalid_config_never_starts_a_step(hostname in "[a-z]{0,3}[ _./]{1,3}[a-z]{0,3}", len in 1usize..6) {
        let (mounts, backend) = lifecycle("invalid");
        let mut pipeline = InstallationPipeline::new(mounts, DeviceSet::from_paths(["/dev/sdX"]));
        let mut config = valid_config();
        config.hostname = hostname;
        let started = Started::default();

        let state = pipeline.run(&config, &registry(len, None, Severity::Fatal), &started);

        prop_assert_eq!(state.status(), PipelineStatus::Failed);
        prop_assert!(state.records().is_empty());
        prop_assert!(started.0.lock().unwrap().is_empty());
        prop_assert_eq!(backend.unmounts.load(Ordering::SeqCst), 0);
    }

    /// Conservative hostnames are accepted.
    #[test]
    fn valid_hostnames_pass(hostname in "[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?") {
        prop_assert!(check_hostname(&hostname).is_none(), "{} rejected", hostname);
    }

    /// Anything longer than 63 characters is rejected.
    #[test]
    fn long_hostnames_fail(hostname in "[a-z]{64,80}") {
        prop_assert!(check_hostname(&hostname).is_some());
    }

    /// Releasing twice in a row never errors.
    #[test]
    fn release_is_idempotent(mount_first in any::<bool>()) {
        let (mut mounts, backend) = lifecycle("release");
        if mount_first {
            mounts.acquire(&MountLayout::new("/dev/sdX2")).unwrap();
        }
        prop_assert!(mounts.release().is_ok());
        prop_assert!(mounts.release().is_ok());
        prop_assert_eq!(backend.unmounts.load(Ordering::SeqCst), usize::from(mount_first));
    }
}
