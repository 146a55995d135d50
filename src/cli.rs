use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::Profile;

/// Default mount point for the target system
pub const DEFAULT_MOUNT_POINT: &str = "/mnt";

/// install-pipeline - Arch Linux installation orchestrator
#[derive(Parser, Debug)]
#[command(name = "install-pipeline")]
#[command(about = "Validate a configuration and drive an Arch Linux installation")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: log every command instead of executing it.
    ///
    /// Validation and device discovery still run so the preview is
    /// realistic; nothing is partitioned, mounted or installed.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a configuration file and list every problem found
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,

        /// Do not require the target device to exist on this machine
        #[arg(long)]
        skip_device_check: bool,
    },
    /// List block devices that can be installed to
    Devices,
    /// Show the steps a profile would run
    Plan {
        #[arg(short, long, default_value_t = Profile::Minimal)]
        profile: Profile,
    },
    /// Run the installation pipeline
    Install {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Where the target system is mounted
        #[arg(short, long, default_value = DEFAULT_MOUNT_POINT)]
        mount_point: PathBuf,

        /// Append step outcomes to this file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Override the profile from the configuration file
        #[arg(short, long)]
        profile: Option<Profile>,

        /// Save the effective configuration before installing
        #[arg(long)]
        save_config: Option<PathBuf>,

        /// Skip the root privilege check (development only)
        #[arg(long)]
        skip_root_check: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
