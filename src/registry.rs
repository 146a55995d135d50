//! Step registry
//!
//! The ordered, fixed list of steps for one installation profile. The
//! registry never reorders: steps run exactly in declaration order, and
//! [`StepRegistry::push`] refuses a declaration that would put a canonical
//! kind before one that must precede it.

use std::sync::Arc;

use crate::backend::InstallerBackend;
use crate::error::RegistryError;
use crate::step::{Step, StepKind};
use crate::types::Profile;

#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Step>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    ///
    /// # Errors
    ///
    /// - `DuplicateStep` if a step with the same name exists
    /// - `OutOfOrder` if the step's kind must run before an already
    ///   declared kind
    pub fn push(&mut self, step: Step) -> Result<(), RegistryError> {
        if self.steps.iter().any(|s| s.name() == step.name()) {
            return Err(RegistryError::DuplicateStep(step.name().to_string()));
        }

        if let Some(kind) = step.kind() {
            let latest = self.steps.iter().filter_map(Step::kind).max();
            if let Some(previous) = latest.filter(|prev| kind < *prev) {
                return Err(RegistryError::OutOfOrder {
                    step: step.name().to_string(),
                    kind,
                    previous,
                });
            }
        }

        self.steps.push(step);
        Ok(())
    }

    /// Builder form of [`push`](Self::push)
    pub fn with(mut self, step: Step) -> Result<Self, RegistryError> {
        self.push(step)?;
        Ok(self)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }

    /// Canonical kinds included by `profile`, in execution order
    pub fn kinds_for(profile: Profile) -> Vec<StepKind> {
        use StepKind::*;
        match profile {
            Profile::Minimal => vec![
                Format,
                Mount,
                BaseInstall,
                CreateUsers,
                Bootloader,
                LocaleTimezone,
                Fstab,
                PostInstall,
            ],
            Profile::Desktop => vec![
                Format,
                Mount,
                BaseInstall,
                CreateUsers,
                Bootloader,
                LocaleTimezone,
                Packages,
                Services,
                Fstab,
                PostInstall,
            ],
        }
    }

    /// The standard registry for `profile`, each step delegating to `backend`
    pub fn for_profile(profile: Profile, backend: Arc<dyn InstallerBackend>) -> Self {
        let steps: Vec<Step> = Self::kinds_for(profile)
            .into_iter()
            .map(|kind| backend_step(kind, Arc::clone(&backend)))
            .collect();

        // kinds_for yields unique kinds in canonical order
        debug_assert!(
            steps.windows(2).all(|w| w[0].kind() < w[1].kind()),
            "profile kinds out of order"
        );
        Self { steps }
    }
}

fn backend_step(kind: StepKind, backend: Arc<dyn InstallerBackend>) -> Step {
    match kind {
        StepKind::Format => Step::of_kind(kind, move |config, _| backend.format_disk(config))
            // Keep the existing layout when the user asked not to wipe
            .skip_if(|config, _| !config.wipe),
        StepKind::Mount => Step::of_kind(kind, move |config, mounts| {
            let layout = backend.mount_layout(config);
            mounts.acquire(&layout)?;
            Ok(())
        })
        .skip_if(|_, mounts| mounts.is_mounted()),
        StepKind::BaseInstall => Step::of_kind(kind, move |config, mounts| {
            backend.install_base(config, mounts.target())
        }),
        StepKind::CreateUsers => Step::of_kind(kind, move |config, mounts| {
            backend.create_users(config, mounts.target())
        }),
        StepKind::Bootloader => Step::of_kind(kind, move |config, mounts| {
            backend.install_bootloader(config, mounts.target())
        }),
        StepKind::LocaleTimezone => Step::of_kind(kind, move |config, mounts| {
            backend.configure_locale_timezone(config, mounts.target())
        }),
        StepKind::Packages => Step::of_kind(kind, move |config, mounts| {
            backend.install_packages(config, mounts.target())
        })
        .skip_if(|config, _| config.packages.is_empty()),
        StepKind::Services => Step::of_kind(kind, move |config, mounts| {
            backend.enable_services(config, mounts.target())
        }),
        StepKind::Fstab => Step::of_kind(kind, move |config, mounts| {
            backend.generate_fstab(config, mounts.target())
        }),
        StepKind::PostInstall => Step::of_kind(kind, move |config, mounts| {
            backend.run_post_install(config, mounts.target())
        })
        .skip_if(|config, _| config.custom_commands.is_empty()),
    }
}
