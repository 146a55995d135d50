//! Pre-flight sanity checks for the runtime environment
//!
//! Before anything touches a disk we verify that:
//! - the backend's required binaries are on `PATH`
//! - we run with root privileges (EUID 0)

use std::fmt::Write as _;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::InstallError;
use crate::process_guard::CommandProcessGroup;

/// Set to `1` or `true` to skip the root check
pub const SKIP_ROOT_ENV: &str = "INSTALL_PIPELINE_SKIP_ROOT_CHECK";

/// Result of environment verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Multi-line explanation of what failed and how to fix it
    pub fn report(&self) -> String {
        let mut out = String::new();
        if !self.is_root {
            out.push_str("Root privileges required to partition disks and install packages.\n");
            out.push_str("  Run with sudo or as the root user.\n");
        }
        if !self.missing_binaries.is_empty() {
            out.push_str("Missing required binaries:\n");
            for binary in &self.missing_binaries {
                let _ = writeln!(
                    out,
                    "  {} (install: pacman -S {})",
                    binary,
                    package_for_binary(binary)
                );
            }
        }
        out
    }
}

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .in_new_process_group()
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Check `binaries` and the effective user
pub fn verify_environment(binaries: &[&str]) -> SanityCheckResult {
    let missing_binaries = binaries
        .iter()
        .filter(|b| !binary_exists(b))
        .map(|b| (*b).to_string())
        .collect();

    SanityCheckResult {
        missing_binaries,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to their Arch Linux package names
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "sgdisk" => "gptfdisk",
        "partprobe" => "parted",
        "mkfs.fat" => "dosfstools",
        "mkfs.ext4" => "e2fsprogs",
        "mkfs.btrfs" => "btrfs-progs",
        "mkfs.xfs" => "xfsprogs",
        "mkfs.f2fs" => "f2fs-tools",
        "pacstrap" | "arch-chroot" | "genfstab" => "arch-install-scripts",
        "lsblk" | "wipefs" | "mount" | "umount" => "util-linux",
        _ => "unknown",
    }
}

pub fn should_skip_root_check() -> bool {
    std::env::var(SKIP_ROOT_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Verify the environment, honouring the root-check skip flag and env var.
///
/// # Errors
///
/// `Preflight` with a readable report when any check fails.
pub fn run_preflight_checks(binaries: &[&str], skip_root: bool) -> Result<(), InstallError> {
    debug!("Running pre-flight sanity checks (skip_root={})", skip_root);

    let mut result = verify_environment(binaries);

    if skip_root || should_skip_root_check() {
        warn!("Root check skipped");
        result.is_root = true;
    }

    if !result.is_ok() {
        return Err(InstallError::Preflight(result.report()));
    }

    info!("Pre-flight checks passed");
    Ok(())
}
