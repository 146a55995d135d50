//! install-pipeline - command line front-end
//!
//! Loads a configuration, builds the step registry for its profile and runs
//! the installation pipeline on a worker thread while the main thread waits
//! and prints progress.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use install_pipeline::backend::{CommandBackend, InstallerBackend};
use install_pipeline::cli::{Cli, Commands};
use install_pipeline::command::{enable_dry_run, is_dry_run};
use install_pipeline::devices::{BlockDevice, DeviceSet, human_size};
use install_pipeline::progress::{ConsoleReporter, MultiReporter, TracingReporter};
use install_pipeline::state::PipelineStatus;
use install_pipeline::{
    AuditLog, InstallConfig, InstallationPipeline, MountLifecycle, ProcessGuard, Profile,
    StepRegistry, process_guard, sanity,
};

/// Exit status for a run stopped by the user, as after SIGINT
const EXIT_CANCELLED: u8 = 130;

fn init_tracing() {
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    if cli.dry_run {
        enable_dry_run();
        info!("Dry-run mode: commands are logged, not executed");
    }

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Validate {
            config,
            skip_device_check,
        } => validate(&config, skip_device_check),
        Commands::Devices => list_devices(),
        Commands::Plan { profile } => {
            print_plan(profile);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Install {
            config,
            mount_point,
            audit_log,
            profile,
            save_config,
            skip_root_check,
        } => install(InstallArgs {
            config,
            mount_point,
            audit_log,
            profile,
            save_config,
            skip_root_check,
        }),
    }
}

fn validate(path: &Path, skip_device_check: bool) -> Result<ExitCode> {
    info!("Validating configuration file: {}", path.display());
    let config = InstallConfig::load_from_file(path)?;

    let devices = if skip_device_check {
        DeviceSet::from_paths([config.target_device.clone()])
    } else {
        DeviceSet::discover()?
    };

    let problems = config.validate(&devices);
    if problems.is_empty() {
        println!("✓ Configuration file is valid: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("✗ {} problem(s) in {}:", problems.len(), path.display());
    for problem in &problems {
        eprintln!("  - {}", problem);
    }
    Ok(ExitCode::FAILURE)
}

fn list_devices() -> Result<ExitCode> {
    let devices = DeviceSet::discover()?;
    if devices.is_empty() {
        println!("No installable disks found");
        return Ok(ExitCode::SUCCESS);
    }
    for device in devices.iter() {
        println!(
            "{:<16} {:>8}  {}{}",
            device.path.display(),
            human_size(device.size),
            device.model.as_deref().unwrap_or("-"),
            if device.read_only { " (read-only)" } else { "" }
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_plan(profile: Profile) {
    let registry = StepRegistry::for_profile(profile, Arc::new(CommandBackend::new()));
    println!("Profile '{}' runs {} step(s):", profile, registry.len());
    for (i, step) in registry.steps().iter().enumerate() {
        let description = step.kind().map(|k| k.description()).unwrap_or_default();
        println!(
            "{:>3}. {:<16} {:<12} {}",
            i + 1,
            step.name(),
            step.severity(),
            description
        );
    }
}

struct InstallArgs {
    config: PathBuf,
    mount_point: PathBuf,
    audit_log: Option<PathBuf>,
    profile: Option<Profile>,
    save_config: Option<PathBuf>,
    skip_root_check: bool,
}

fn install(args: InstallArgs) -> Result<ExitCode> {
    let backend = Arc::new(CommandBackend::new());

    info!("Loading configuration from {}", args.config.display());
    let mut config = InstallConfig::load_from_file(&args.config)?;
    if let Some(profile) = args.profile {
        config.profile = profile;
    }

    if is_dry_run() {
        info!("Skipping pre-flight checks in dry-run mode");
    } else {
        sanity::run_preflight_checks(&backend.required_binaries(&config), args.skip_root_check)?;
    }

    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        println!("✓ Configuration saved to {}", path.display());
    }

    let mut devices = match DeviceSet::discover() {
        Ok(devices) => devices,
        Err(e) if is_dry_run() => {
            warn!("Device discovery failed: {:#}", e);
            DeviceSet::default()
        }
        Err(e) => return Err(e),
    };
    if is_dry_run() && !devices.contains(&config.target_device) {
        warn!(
            "{} is not present, continuing because this is a dry run",
            config.target_device.display()
        );
        devices.insert(BlockDevice {
            path: config.target_device.clone(),
            size: 0,
            model: None,
            read_only: false,
        });
    }

    let mounts = MountLifecycle::system(&args.mount_point)?;
    let mut pipeline = InstallationPipeline::new(mounts, devices);
    if let Some(path) = &args.audit_log {
        let log = AuditLog::open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        pipeline = pipeline.with_audit_log(log);
    }

    if let Err(e) = process_guard::init_signal_handlers(pipeline.cancel_token()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    // Kills any still-registered child if we leave early
    let _guard = ProcessGuard::new();

    let registry = StepRegistry::for_profile(config.profile, backend);
    let reporter = MultiReporter::new()
        .with(ConsoleReporter::stdout())
        .with(TracingReporter);

    println!(
        "Installing to {} ({} profile, {} step(s))",
        config.target_device.display(),
        config.profile,
        registry.len()
    );

    let state = pipeline.spawn(config, registry, reporter)?.join()?;

    println!();
    println!("{}", state.summary());

    Ok(match state.status() {
        PipelineStatus::Completed => ExitCode::SUCCESS,
        PipelineStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::FAILURE,
    })
}
