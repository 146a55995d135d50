//! Type-safe configuration types for the installer
//!
//! Enums instead of strings for every closed set of choices, so typos are
//! caught when the configuration file is parsed rather than halfway through
//! an installation.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Filesystem for the root partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Filesystem {
    #[default]
    Ext4,
    Btrfs,
    Xfs,
    F2fs,
}

impl Filesystem {
    /// The `mkfs.*` binary that creates this filesystem
    pub fn mkfs_binary(self) -> &'static str {
        match self {
            Self::Ext4 => "mkfs.ext4",
            Self::Btrfs => "mkfs.btrfs",
            Self::Xfs => "mkfs.xfs",
            Self::F2fs => "mkfs.f2fs",
        }
    }

    /// Flag that makes mkfs overwrite an existing signature without asking
    pub fn force_flag(self) -> &'static str {
        match self {
            Self::Ext4 => "-F",
            Self::Btrfs | Self::Xfs | Self::F2fs => "-f",
        }
    }
}

/// Bootloader selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Bootloader {
    #[default]
    Grub,
    SystemdBoot,
}

/// Optional features toggled by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Feature {
    /// Enable systemd-timesyncd on the target
    Ntp,
    /// zram-based swap
    Swap,
    /// LUKS encryption of the root partition
    Encryption,
}

/// Installation profile, decides which steps the registry contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Profile {
    #[default]
    Minimal,
    Desktop,
}
