//! System command execution for step actions
//!
//! Every external tool the backend runs goes through [`run_command`] so that:
//!
//! - the child runs in its own process group (killed if we die)
//! - its PID is registered with the global [`ChildRegistry`] while it runs
//! - stdout/stderr are captured for error reporting
//! - dry-run mode logs the command instead of executing it

use anyhow::{Context, Result};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::process_guard::{ChildRegistry, CommandProcessGroup};

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Log commands instead of executing them
pub fn enable_dry_run() {
    DRY_RUN.store(true, Ordering::SeqCst);
}

pub fn disable_dry_run() {
    DRY_RUN.store(false, Ordering::SeqCst);
}

pub fn is_dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

/// A command line plus optional stdin.
#[derive(Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args.extend(
            args.into_iter()
                .map(|a| a.as_ref().to_string_lossy().into_owned()),
        );
        self
    }

    /// Data written to the child's stdin. Never logged.
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.to_string())
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Return an error carrying stderr if the command failed.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }
}

/// Execute a command and capture its output.
///
/// A non-zero exit is *not* an error here; use
/// [`CommandOutput::ensure_success`] or [`run_checked`]. Spawn and wait
/// failures are.
pub fn run_command(spec: &CommandSpec) -> Result<CommandOutput> {
    if is_dry_run() {
        info!("[dry-run] {}", spec);
        return Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        });
    }

    debug!(command = %spec, "Spawning command");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", spec.program))?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    if let (Some(data), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
        // Dropping stdin at the end of this block closes the pipe
        if let Err(e) = stdin.write_all(data.as_bytes()) {
            tracing::warn!("Failed to write stdin of {}: {}", spec.program, e);
        }
    }

    let output = child.wait_with_output();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let output = output.with_context(|| format!("Failed waiting for {}", spec.program))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!(command = %spec, "Command succeeded");
    } else {
        info!(
            command = %spec,
            exit_code = result.exit_code.unwrap_or(-1),
            "Command failed"
        );
    }

    Ok(result)
}

/// Run a command and fail unless it exits successfully.
pub fn run_checked(spec: &CommandSpec) -> Result<CommandOutput> {
    let output = run_command(spec)?;
    output.ensure_success(&spec.to_string())?;
    Ok(output)
}
