//! Installation configuration model
//!
//! `InstallConfig` is the single, immutable snapshot of every user choice the
//! pipeline needs. It is loaded from (or saved to) a JSON file, validated once
//! before the pipeline starts, and then only ever handed out as
//! `&InstallConfig`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::devices::DeviceSet;
use crate::types::{Bootloader, Feature, Filesystem, Profile};

const HOSTNAME_MAX_LEN: usize = 63;
const USERNAME_MAX_LEN: usize = 32;

/// A password, either in clear text or already crypt(3)-hashed.
///
/// `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Secret {
    /// Clear-text password, hashed by `chpasswd` on the target
    Plain(String),
    /// Pre-hashed password, passed to `chpasswd -e`
    Hashed(String),
}

impl Secret {
    /// Raw value as it must be fed to chpasswd
    pub fn expose(&self) -> &str {
        match self {
            Self::Plain(s) | Self::Hashed(s) => s,
        }
    }

    pub fn is_hashed(&self) -> bool {
        matches!(self, Self::Hashed(_))
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }

    /// Why this value cannot be fed to chpasswd as one `user:password` line
    fn line_problem(&self) -> Option<&'static str> {
        let value = self.expose();
        if value.contains(['\n', '\r']) {
            Some("must not contain line breaks")
        } else if value.contains(':') {
            Some("must not contain ':'")
        } else {
            None
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => write!(f, "Secret::Plain(<redacted>)"),
            Self::Hashed(_) => write!(f, "Secret::Hashed(<redacted>)"),
        }
    }
}

/// One account to create on the target system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: String,
    pub password: Secret,
    /// Admin users join the `wheel` group
    #[serde(default)]
    pub is_admin: bool,
}

impl UserAccount {
    pub fn new(username: impl Into<String>, password: Secret, is_admin: bool) -> Self {
        Self {
            username: username.into(),
            password,
            is_admin,
        }
    }
}

/// A single configuration problem found by [`InstallConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Target device must be specified")]
    EmptyDevice,

    #[error("Target device {} was not found among the discovered disks", .0.display())]
    UnknownDevice(PathBuf),

    #[error("Hostname must be specified")]
    EmptyHostname,

    #[error("Hostname '{hostname}' is invalid: {reason}")]
    InvalidHostname {
        hostname: String,
        reason: &'static str,
    },

    #[error("At least one user or a root password is required")]
    NoAccounts,

    #[error("Password for '{account}' must not be empty")]
    EmptyPassword { account: String },

    #[error("Password for '{account}' is invalid: {reason}")]
    InvalidPassword {
        account: String,
        reason: &'static str,
    },

    #[error("Timezone '{0}' is not a valid zoneinfo name")]
    InvalidTimezone(String),

    #[error("Username '{username}' is invalid: {reason}")]
    InvalidUsername {
        username: String,
        reason: &'static str,
    },

    #[error("User '{0}' is declared more than once")]
    DuplicateUser(String),

    #[error("Package name '{0}' is invalid")]
    InvalidPackage(String),

    #[error("Locale '{0}' is invalid")]
    InvalidLocale(String),

    #[error("Keymap '{0}' is invalid")]
    InvalidKeymap(String),

    #[error("At least one kernel package is required")]
    NoKernels,

    #[error("Kernel package name '{0}' is invalid")]
    InvalidKernel(String),

    #[error("Target device {} is read-only", .0.display())]
    ReadOnlyDevice(PathBuf),

    #[error("Feature '{0}' is not supported by this installer")]
    UnsupportedFeature(Feature),
}

/// Every choice needed to drive one installation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Whole-disk device to install to, e.g. `/dev/sda`
    pub target_device: PathBuf,
    /// Wipe and repartition the device; `false` keeps the existing layout
    #[serde(default = "default_wipe")]
    pub wipe: bool,
    #[serde(default)]
    pub filesystem: Filesystem,
    pub hostname: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_keymap")]
    pub keymap: String,
    pub timezone: String,
    #[serde(default)]
    pub users: Vec<UserAccount>,
    #[serde(default)]
    pub root_password: Option<Secret>,
    /// Extra packages installed after the base system
    #[serde(default)]
    pub packages: Vec<String>,
    /// systemd units enabled on the target
    #[serde(default)]
    pub services: Vec<String>,
    /// Shell commands run inside the target after everything else
    #[serde(default)]
    pub custom_commands: Vec<String>,
    #[serde(default = "default_kernels")]
    pub kernels: Vec<String>,
    #[serde(default)]
    pub bootloader: Bootloader,
    #[serde(default)]
    pub features: BTreeSet<Feature>,
    #[serde(default)]
    pub profile: Profile,
}

fn default_wipe() -> bool {
    true
}

fn default_locale() -> String {
    "en_US.UTF-8".to_string()
}

fn default_keymap() -> String {
    "us".to_string()
}

fn default_kernels() -> Vec<String> {
    vec!["linux".to_string()]
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            target_device: PathBuf::new(),
            wipe: default_wipe(),
            filesystem: Filesystem::default(),
            hostname: "archlinux".to_string(),
            locale: default_locale(),
            keymap: default_keymap(),
            timezone: "UTC".to_string(),
            users: Vec::new(),
            root_password: None,
            packages: Vec::new(),
            services: Vec::new(),
            custom_commands: Vec::new(),
            kernels: default_kernels(),
            bootloader: Bootloader::default(),
            features: BTreeSet::new(),
            profile: Profile::default(),
        }
    }
}

impl InstallConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Check every field and return all problems found.
    ///
    /// An empty vector means the configuration is safe to hand to the
    /// pipeline. This never touches the system; `devices` is a snapshot
    /// taken by the caller.
    pub fn validate(&self, devices: &DeviceSet) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.target_device.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyDevice);
        } else {
            match devices.get(&self.target_device) {
                None => errors.push(ValidationError::UnknownDevice(self.target_device.clone())),
                Some(device) if device.read_only => {
                    errors.push(ValidationError::ReadOnlyDevice(self.target_device.clone()))
                }
                Some(_) => {}
            }
        }

        if let Some(err) = check_hostname(&self.hostname) {
            errors.push(err);
        }

        if self.users.is_empty() && self.root_password.is_none() {
            errors.push(ValidationError::NoAccounts);
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if let Some(reason) = username_problem(&user.username) {
                errors.push(ValidationError::InvalidUsername {
                    username: user.username.clone(),
                    reason,
                });
            }
            if !seen.insert(user.username.as_str()) {
                errors.push(ValidationError::DuplicateUser(user.username.clone()));
            }
            errors.extend(password_problem(&user.username, &user.password));
        }

        if let Some(root) = &self.root_password {
            errors.extend(password_problem("root", root));
        }

        if !is_plausible_timezone(&self.timezone) {
            errors.push(ValidationError::InvalidTimezone(self.timezone.clone()));
        }

        if !is_plausible_locale(&self.locale) {
            errors.push(ValidationError::InvalidLocale(self.locale.clone()));
        }

        if !is_plausible_keymap(&self.keymap) {
            errors.push(ValidationError::InvalidKeymap(self.keymap.clone()));
        }

        if self.kernels.is_empty() {
            errors.push(ValidationError::NoKernels);
        }
        for kernel in &self.kernels {
            if !is_plausible_package(kernel) {
                errors.push(ValidationError::InvalidKernel(kernel.clone()));
            }
        }

        for package in &self.packages {
            if !is_plausible_package(package) {
                errors.push(ValidationError::InvalidPackage(package.clone()));
            }
        }

        // LUKS setup is not implemented by any backend
        if self.has_feature(Feature::Encryption) {
            errors.push(ValidationError::UnsupportedFeature(Feature::Encryption));
        }

        errors
    }
}

fn password_problem(account: &str, password: &Secret) -> Option<ValidationError> {
    if password.is_empty() {
        return Some(ValidationError::EmptyPassword {
            account: account.to_string(),
        });
    }
    password
        .line_problem()
        .map(|reason| ValidationError::InvalidPassword {
            account: account.to_string(),
            reason,
        })
}

/// Hostname problem, if any: 1-63 ASCII letters, digits or inner hyphens
pub fn check_hostname(hostname: &str) -> Option<ValidationError> {
    if hostname.is_empty() {
        return Some(ValidationError::EmptyHostname);
    }

    let reason = if hostname.len() > HOSTNAME_MAX_LEN {
        Some("must be at most 63 characters")
    } else if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        Some("only letters, digits and hyphens are allowed")
    } else if hostname.starts_with('-') || hostname.ends_with('-') {
        Some("must not start or end with a hyphen")
    } else {
        None
    };

    reason.map(|reason| ValidationError::InvalidHostname {
        hostname: hostname.to_string(),
        reason,
    })
}

fn username_problem(username: &str) -> Option<&'static str> {
    if username.is_empty() || username.len() > USERNAME_MAX_LEN {
        return Some("must be 1-32 characters long");
    }
    if !username.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
        return Some("must start with a lowercase letter or underscore");
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Some("only lowercase letters, digits, '_' and '-' are allowed");
    }
    if username == "root" {
        return Some("root is configured through root_password");
    }
    None
}

/// Zoneinfo names are relative paths like `Europe/Berlin` or `UTC`.
fn is_plausible_timezone(tz: &str) -> bool {
    !tz.is_empty()
        && !tz.starts_with('/')
        && tz
            .split('/')
            .all(|part| !part.is_empty() && part != ".." && part != ".")
        && tz
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'))
}

fn is_plausible_package(name: &str) -> bool {
    !name.is_empty() && !name.contains(char::is_whitespace)
}

/// Locales look like `en_US.UTF-8` or `sr_RS@latin`
fn is_plausible_locale(locale: &str) -> bool {
    locale.starts_with(|c: char| c.is_ascii_alphabetic())
        && locale
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'))
}

/// Console keymaps look like `us`, `de-latin1` or `fr_CH`
fn is_plausible_keymap(keymap: &str) -> bool {
    keymap.starts_with(|c: char| c.is_ascii_alphanumeric())
        && keymap
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
