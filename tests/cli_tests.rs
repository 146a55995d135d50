//! Command line tests against the built binary
//!
//! Dry-run is a process-wide switch, so installs are exercised here in a
//! child process instead of inside the library's unit tests.

use std::path::Path;
use std::process::{Command, Output};

use install_pipeline::{Feature, InstallConfig, Secret, UserAccount};

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_install-pipeline"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn write_config(dir: &Path, config: &InstallConfig) -> std::path::PathBuf {
    let path = dir.join("config.json");
    config.save_to_file(&path).unwrap();
    path
}

fn good_config() -> InstallConfig {
    InstallConfig {
        target_device: "/dev/install-pipeline-test".into(),
        hostname: "testbox".into(),
        users: vec![UserAccount::new("alice", Secret::Plain("hunter2".into()), true)],
        custom_commands: vec!["echo hello".into()],
        ..InstallConfig::default()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn plan_lists_profile_steps() {
    let output = bin().args(["plan", "--profile", "desktop"]).output().unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("runs 10 step(s)"));
    assert!(text.contains("packages"));
    assert!(text.contains("recoverable"));
}

#[test]
fn validate_accepts_good_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), &good_config());

    let output = bin()
        .arg("validate")
        .arg(&path)
        .arg("--skip-device-check")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("valid"));
}

#[test]
fn validate_reports_every_problem() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = good_config();
    config.hostname.clear();
    config.users.clear();
    let path = write_config(dir.path(), &config);

    let output = bin()
        .arg("validate")
        .arg(&path)
        .arg("--skip-device-check")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("2 problem(s)"), "{}", err);
}

#[test]
fn validate_missing_file_fails() {
    let output = bin()
        .args(["validate", "/nonexistent/config.json", "--skip-device-check"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn dry_run_install_completes_and_writes_audit_log() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(dir.path(), &good_config());
    let audit = dir.path().join("audit/install.log");
    let saved = dir.path().join("saved.json");

    let output = bin()
        .arg("--dry-run")
        .arg("install")
        .arg("--config")
        .arg(&config_path)
        .arg("--mount-point")
        .arg(dir.path().join("mnt"))
        .arg("--audit-log")
        .arg(&audit)
        .arg("--save-config")
        .arg(&saved)
        .output()
        .unwrap();

    assert!(output.status.success(), "{}\n{}", stdout(&output), stderr(&output));
    assert!(stdout(&output).contains("Installation complete"));

    let log = std::fs::read_to_string(&audit).unwrap();
    assert!(log.lines().next().unwrap().contains("START"));
    assert!(log.contains("COMPLETED genfstab"));
    assert!(log.lines().last().unwrap().contains("END Installation complete"));

    let reloaded = InstallConfig::load_from_file(&saved).unwrap();
    assert_eq!(reloaded.hostname, "testbox");

    // Nothing may actually have been created under the mount point
    assert!(!dir.path().join("mnt/etc/fstab").exists());
}

#[test]
fn dry_run_install_with_invalid_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = good_config();
    config.hostname = "-bad-".into();
    let config_path = write_config(dir.path(), &config);

    let output = bin()
        .arg("--dry-run")
        .arg("install")
        .arg("--config")
        .arg(&config_path)
        .arg("--mount-point")
        .arg(dir.path().join("mnt"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stdout(&output).contains("Installation failed"));
}

#[test]
fn encrypted_install_is_refused_before_any_step() {
    for wipe in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = good_config();
        config.wipe = wipe;
        config.features.insert(Feature::Encryption);
        let config_path = write_config(dir.path(), &config);
        let audit = dir.path().join("install.log");

        let output = bin()
            .arg("--dry-run")
            .arg("install")
            .arg("--config")
            .arg(&config_path)
            .arg("--mount-point")
            .arg(dir.path().join("mnt"))
            .arg("--audit-log")
            .arg(&audit)
            .output()
            .unwrap();

        assert!(!output.status.success(), "wipe={}", wipe);
        assert!(stdout(&output).contains("Installation failed"));
        // Only the START and END lines: no step produced a record
        let log = std::fs::read_to_string(&audit).unwrap();
        assert_eq!(log.lines().count(), 2, "wipe={}: {}", wipe, log);
        assert!(log.contains("encryption"), "{}", log);
    }
}
