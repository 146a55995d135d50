//! Installation steps
//!
//! A [`Step`] is one named unit of installation work: an action, an optional
//! "already done" predicate and a fatal/recoverable classification. Actions
//! are opaque to the pipeline; it only sees success or failure.

use std::fmt;
use strum::{Display, EnumIter, EnumString};

use crate::config::InstallConfig;
use crate::mount::MountLifecycle;

/// The canonical kinds of installation work, in the only order they may run.
///
/// Formatting must precede mounting, which must precede anything writing to
/// the target, and so on. [`StepKind::order`] encodes that sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum StepKind {
    /// Partition and format the target device (destructive)
    Format = 0,
    /// Mount the new filesystems at the mount point
    Mount = 1,
    /// pacstrap the base system
    BaseInstall = 2,
    CreateUsers = 3,
    Bootloader = 4,
    LocaleTimezone = 5,
    Packages = 6,
    Services = 7,
    #[strum(serialize = "genfstab")]
    Fstab = 8,
    PostInstall = 9,
}

impl StepKind {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Whether this kind destroys data on the target device
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Format)
    }

    /// Default severity when the registry builds this step
    pub const fn default_severity(self) -> Severity {
        match self {
            Self::Format
            | Self::Mount
            | Self::BaseInstall
            | Self::CreateUsers
            | Self::Bootloader
            | Self::Fstab => Severity::Fatal,
            Self::LocaleTimezone | Self::Packages | Self::Services | Self::PostInstall => {
                Severity::Recoverable
            }
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Format => "Partitioning and formatting disk",
            Self::Mount => "Mounting filesystems",
            Self::BaseInstall => "Installing base system",
            Self::CreateUsers => "Creating users",
            Self::Bootloader => "Installing bootloader",
            Self::LocaleTimezone => "Configuring locale and timezone",
            Self::Packages => "Installing additional packages",
            Self::Services => "Enabling services",
            Self::Fstab => "Generating fstab",
            Self::PostInstall => "Running post-install commands",
        }
    }
}

/// What a failure of this step means for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Abort the installation
    Fatal,
    /// Log a warning and continue with the next step
    Recoverable,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => f.write_str("fatal"),
            Self::Recoverable => f.write_str("recoverable"),
        }
    }
}

/// The work a step performs.
///
/// Implemented for any matching closure, so fake steps in tests are plain
/// lambdas.
pub trait StepAction: Send + Sync {
    fn run(&self, config: &InstallConfig, mounts: &mut MountLifecycle) -> anyhow::Result<()>;
}

impl<F> StepAction for F
where
    F: Fn(&InstallConfig, &mut MountLifecycle) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, config: &InstallConfig, mounts: &mut MountLifecycle) -> anyhow::Result<()> {
        self(config, mounts)
    }
}

/// Idempotence predicate: `true` means the step's work is already done
pub type SkipPredicate = Box<dyn Fn(&InstallConfig, &MountLifecycle) -> bool + Send + Sync>;

/// One named, ordered unit of installation work
pub struct Step {
    name: String,
    kind: Option<StepKind>,
    severity: Severity,
    action: Box<dyn StepAction>,
    skip_if: Option<SkipPredicate>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("severity", &self.severity)
            .field("has_skip_predicate", &self.skip_if.is_some())
            .finish()
    }
}

impl Step {
    pub fn new<F>(name: impl Into<String>, severity: Severity, action: F) -> Self
    where
        F: Fn(&InstallConfig, &mut MountLifecycle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::from_action(name, severity, action)
    }

    /// Build a step around any [`StepAction`] implementor
    pub fn from_action(
        name: impl Into<String>,
        severity: Severity,
        action: impl StepAction + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: None,
            severity,
            action: Box::new(action),
            skip_if: None,
        }
    }

    pub fn fatal<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&InstallConfig, &mut MountLifecycle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, Severity::Fatal, action)
    }

    pub fn recoverable<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&InstallConfig, &mut MountLifecycle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, Severity::Recoverable, action)
    }

    /// A step of a canonical kind, named and classified by the kind
    pub fn of_kind<F>(kind: StepKind, action: F) -> Self
    where
        F: Fn(&InstallConfig, &mut MountLifecycle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(kind.to_string(), kind.default_severity(), action).with_kind(kind)
    }

    /// Tag the step with a canonical kind so the registry can check ordering
    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn skip_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&InstallConfig, &MountLifecycle) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Box::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Option<StepKind> {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn should_skip(&self, config: &InstallConfig, mounts: &MountLifecycle) -> bool {
        self.skip_if
            .as_ref()
            .is_some_and(|predicate| predicate(config, mounts))
    }

    pub fn run(&self, config: &InstallConfig, mounts: &mut MountLifecycle) -> anyhow::Result<()> {
        self.action.run(config, mounts)
    }
}
