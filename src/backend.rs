//! Installer backend
//!
//! The pipeline treats step actions as opaque. The [`InstallerBackend`] trait
//! is the seam between the registry's canonical steps and whatever performs
//! the work; [`CommandBackend`] does it with the usual Arch tooling
//! (`sgdisk`, `mkfs.*`, `pacstrap`, `arch-chroot`, `genfstab`).
//!
//! Command lines are built by pure `*_commands` functions so they can be
//! checked without touching a disk.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::command::{CommandSpec, is_dry_run, run_checked};
use crate::config::InstallConfig;
use crate::mount::MountLayout;
use crate::types::{Bootloader, Feature, Profile};

/// Size of the EFI system partition created by [`CommandBackend`]
pub const ESP_SIZE: &str = "+1G";

const ZRAM_CONFIG: &str = "[zram0]\nzram-size = min(ram / 2, 8192)\ncompression-algorithm = zstd\n";

/// Performs the real work behind each canonical step.
///
/// Every method receives the immutable configuration and the mount point the
/// target system lives under.
pub trait InstallerBackend: Send + Sync {
    /// Partition and format the target device
    fn format_disk(&self, config: &InstallConfig) -> Result<()>;

    /// What the mount step should mount
    fn mount_layout(&self, config: &InstallConfig) -> MountLayout {
        default_layout(&config.target_device)
    }

    fn install_base(&self, config: &InstallConfig, target: &Path) -> Result<()>;
    fn create_users(&self, config: &InstallConfig, target: &Path) -> Result<()>;
    fn install_bootloader(&self, config: &InstallConfig, target: &Path) -> Result<()>;
    fn configure_locale_timezone(&self, config: &InstallConfig, target: &Path) -> Result<()>;
    fn install_packages(&self, config: &InstallConfig, target: &Path) -> Result<()>;
    fn enable_services(&self, config: &InstallConfig, target: &Path) -> Result<()>;
    fn generate_fstab(&self, config: &InstallConfig, target: &Path) -> Result<()>;
    fn run_post_install(&self, config: &InstallConfig, target: &Path) -> Result<()>;

    /// Host binaries that must be on `PATH` to install `config`
    fn required_binaries(&self, _config: &InstallConfig) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Partition device path for a disk.
///
/// `/dev/sda` → `/dev/sda1`, `/dev/nvme0n1` → `/dev/nvme0n1p1`.
pub fn partition_path(disk: &Path, number: u32) -> PathBuf {
    let disk = disk.display().to_string();
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk, number))
    } else {
        PathBuf::from(format!("{}{}", disk, number))
    }
}

/// ESP on partition 1 mounted at `boot`, root on partition 2
pub fn default_layout(disk: &Path) -> MountLayout {
    MountLayout::new(partition_path(disk, 2)).with_nested(partition_path(disk, 1), "boot")
}

fn chroot(target: &Path, program: &str) -> CommandSpec {
    CommandSpec::new("arch-chroot").arg(target).arg(program)
}

pub fn format_commands(config: &InstallConfig) -> Vec<CommandSpec> {
    let disk = &config.target_device;
    let esp = partition_path(disk, 1);
    let root = partition_path(disk, 2);
    let fs = config.filesystem;

    vec![
        CommandSpec::new("wipefs").arg("--all").arg(disk),
        CommandSpec::new("sgdisk").arg("--zap-all").arg(disk),
        CommandSpec::new("sgdisk")
            .args(["-n", format!("1:0:{}", ESP_SIZE).as_str(), "-t", "1:ef00", "-c", "1:EFI"])
            .arg(disk),
        CommandSpec::new("sgdisk")
            .args(["-n", "2:0:0", "-t", "2:8300", "-c", "2:root"])
            .arg(disk),
        CommandSpec::new("partprobe").arg(disk),
        CommandSpec::new("mkfs.fat").args(["-F", "32"]).arg(&esp),
        CommandSpec::new(fs.mkfs_binary()).arg(fs.force_flag()).arg(&root),
    ]
}

/// Packages passed to `pacstrap`
pub fn base_packages(config: &InstallConfig) -> Vec<String> {
    let mut packages: Vec<String> = ["base", "linux-firmware", "sudo"]
        .iter()
        .map(ToString::to_string)
        .collect();
    packages.extend(config.kernels.iter().cloned());
    match config.bootloader {
        Bootloader::Grub => packages.extend(["grub".to_string(), "efibootmgr".to_string()]),
        Bootloader::SystemdBoot => {}
    }
    if config.has_feature(Feature::Swap) {
        packages.push("zram-generator".into());
    }
    if config.profile == Profile::Desktop {
        packages.push("networkmanager".into());
    }
    packages
}

pub fn base_install_commands(config: &InstallConfig, target: &Path) -> Vec<CommandSpec> {
    vec![
        CommandSpec::new("pacstrap")
            .arg("-K")
            .arg(target)
            .args(base_packages(config)),
    ]
}

/// `useradd`/`chpasswd` invocations. Passwords travel over stdin only.
pub fn user_commands(config: &InstallConfig, target: &Path) -> Vec<CommandSpec> {
    let mut commands = Vec::new();

    if let Some(root) = &config.root_password {
        commands.push(chpasswd(target, "root", root.expose(), root.is_hashed()));
    }

    for user in &config.users {
        let mut useradd = chroot(target, "useradd").arg("-m");
        if user.is_admin {
            useradd = useradd.args(["-G", "wheel"]);
        }
        commands.push(useradd.arg(&user.username));
        commands.push(chpasswd(
            target,
            &user.username,
            user.password.expose(),
            user.password.is_hashed(),
        ));
    }

    if config.users.iter().any(|u| u.is_admin) {
        commands.push(
            chroot(target, "bash")
                .arg("-c")
                .arg("echo '%wheel ALL=(ALL:ALL) ALL' > /etc/sudoers.d/10-wheel && chmod 440 /etc/sudoers.d/10-wheel"),
        );
    }
    commands
}

fn chpasswd(target: &Path, user: &str, password: &str, hashed: bool) -> CommandSpec {
    let mut spec = chroot(target, "chpasswd");
    if hashed {
        spec = spec.arg("-e");
    }
    spec.stdin(format!("{}:{}\n", user, password))
}

pub fn bootloader_commands(config: &InstallConfig, target: &Path) -> Vec<CommandSpec> {
    match config.bootloader {
        Bootloader::Grub => vec![
            chroot(target, "grub-install").args([
                "--target=x86_64-efi",
                "--efi-directory=/boot",
                "--bootloader-id=GRUB",
            ]),
            chroot(target, "grub-mkconfig").args(["-o", "/boot/grub/grub.cfg"]),
        ],
        Bootloader::SystemdBoot => vec![chroot(target, "bootctl").arg("install")],
    }
}

pub fn locale_timezone_commands(config: &InstallConfig, target: &Path) -> Vec<CommandSpec> {
    let locale = &config.locale;
    vec![
        chroot(target, "ln").args([
            "-sf",
            format!("/usr/share/zoneinfo/{}", config.timezone).as_str(),
            "/etc/localtime",
        ]),
        chroot(target, "hwclock").arg("--systohc"),
        chroot(target, "sed").args([
            "-i",
            format!("s/^#{} /{} /", locale.replace('.', "\\."), locale).as_str(),
            "/etc/locale.gen",
        ]),
        chroot(target, "locale-gen"),
    ]
}

/// Files written under the target root, paths relative to it
pub fn locale_files(config: &InstallConfig) -> Vec<(PathBuf, String)> {
    vec![
        (
            PathBuf::from("etc/locale.conf"),
            format!("LANG={}\n", config.locale),
        ),
        (
            PathBuf::from("etc/vconsole.conf"),
            format!("KEYMAP={}\n", config.keymap),
        ),
        (PathBuf::from("etc/hostname"), format!("{}\n", config.hostname)),
    ]
}

pub fn package_commands(config: &InstallConfig, target: &Path) -> Vec<CommandSpec> {
    if config.packages.is_empty() {
        return Vec::new();
    }
    vec![
        chroot(target, "pacman")
            .args(["-S", "--noconfirm", "--needed"])
            .args(&config.packages),
    ]
}

/// Services to enable, including those implied by features and profile
pub fn service_units(config: &InstallConfig) -> Vec<String> {
    let mut units = config.services.clone();
    if config.has_feature(Feature::Ntp) {
        units.push("systemd-timesyncd".into());
    }
    if config.profile == Profile::Desktop {
        units.push("NetworkManager".into());
    }
    let mut seen = std::collections::HashSet::new();
    units.retain(|u| seen.insert(u.clone()));
    units
}

pub fn service_commands(config: &InstallConfig, target: &Path) -> Vec<CommandSpec> {
    service_units(config)
        .into_iter()
        .map(|unit| chroot(target, "systemctl").arg("enable").arg(unit))
        .collect()
}

pub fn post_install_commands(config: &InstallConfig, target: &Path) -> Vec<CommandSpec> {
    config
        .custom_commands
        .iter()
        .map(|cmd| chroot(target, "bash").arg("-c").arg(cmd))
        .collect()
}

/// [`InstallerBackend`] that runs system commands through
/// [`crate::command::run_command`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBackend;

impl CommandBackend {
    pub fn new() -> Self {
        Self
    }

    fn run_all(&self, what: &str, commands: &[CommandSpec]) -> Result<()> {
        debug!("{}: {} command(s)", what, commands.len());
        for spec in commands {
            run_checked(spec).with_context(|| format!("{} failed", what))?;
        }
        Ok(())
    }

    fn write_target_file(&self, path: &Path, content: &str, append: bool) -> Result<()> {
        if is_dry_run() {
            info!("[dry-run] write {} bytes to {}", content.len(), path.display());
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

impl InstallerBackend for CommandBackend {
    fn format_disk(&self, config: &InstallConfig) -> Result<()> {
        info!("Formatting {}", config.target_device.display());
        self.run_all("format", &format_commands(config))
    }

    fn install_base(&self, config: &InstallConfig, target: &Path) -> Result<()> {
        self.run_all("pacstrap", &base_install_commands(config, target))
    }

    fn create_users(&self, config: &InstallConfig, target: &Path) -> Result<()> {
        self.run_all("create users", &user_commands(config, target))
    }

    fn install_bootloader(&self, config: &InstallConfig, target: &Path) -> Result<()> {
        self.run_all(
            &format!("{} install", config.bootloader),
            &bootloader_commands(config, target),
        )
    }

    fn configure_locale_timezone(&self, config: &InstallConfig, target: &Path) -> Result<()> {
        for (path, content) in locale_files(config) {
            self.write_target_file(&target.join(path), &content, false)?;
        }
        self.run_all("locale/timezone", &locale_timezone_commands(config, target))
    }

    fn install_packages(&self, config: &InstallConfig, target: &Path) -> Result<()> {
        self.run_all("pacman", &package_commands(config, target))
    }

    fn enable_services(&self, config: &InstallConfig, target: &Path) -> Result<()> {
        if config.has_feature(Feature::Swap) {
            self.write_target_file(
                &target.join("etc/systemd/zram-generator.conf"),
                ZRAM_CONFIG,
                false,
            )?;
        }
        self.run_all("systemctl enable", &service_commands(config, target))
    }

    fn generate_fstab(&self, _config: &InstallConfig, target: &Path) -> Result<()> {
        let output = run_checked(&CommandSpec::new("genfstab").arg("-U").arg(target))
            .context("genfstab failed")?;
        self.write_target_file(&target.join("etc/fstab"), &output.stdout, true)
    }

    fn run_post_install(&self, config: &InstallConfig, target: &Path) -> Result<()> {
        self.run_all("post-install", &post_install_commands(config, target))
    }

    /// Bootloader tools run inside the chroot and come from `base_packages`,
    /// so only the host side is listed here.
    fn required_binaries(&self, config: &InstallConfig) -> Vec<&'static str> {
        let mut binaries = vec!["lsblk", "mount", "umount", "pacstrap", "arch-chroot", "genfstab"];
        if config.wipe {
            binaries.extend([
                "wipefs",
                "sgdisk",
                "partprobe",
                "mkfs.fat",
                config.filesystem.mkfs_binary(),
            ]);
        }
        binaries
    }
}
