//! Progress reporting
//!
//! The pipeline emits discrete [`ProgressEvent`]s to a [`ProgressReporter`].
//! Reporters know nothing about the pipeline and the pipeline knows nothing
//! about presentation; console output, structured logs and UI bridges are
//! separate implementations that can be combined with [`MultiReporter`].

use std::fmt;
use std::io::Write;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::state::unix_timestamp;

/// Which moment of a step an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Starting,
    Completed,
    Failed,
    /// Recoverable failure, cancellation notice or cleanup problem
    Warning,
    /// Skip predicate reported the step as already done
    Skipped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Warning => "warning",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One step-level event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub step: String,
    pub phase: Phase,
    pub message: String,
    /// Seconds since the UNIX epoch
    pub timestamp: u64,
}

impl ProgressEvent {
    pub fn new(step: impl Into<String>, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            phase,
            message: message.into(),
            timestamp: unix_timestamp(),
        }
    }
}

/// Sink for progress events.
///
/// Events for one step arrive in pipeline order, and no event of step N+1 is
/// emitted before the last event of step N.
pub trait ProgressReporter: Send {
    fn report(&self, event: &ProgressEvent);
}

impl<R: ProgressReporter + Sync + ?Sized> ProgressReporter for &R {
    fn report(&self, event: &ProgressEvent) {
        (**self).report(event)
    }
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for Box<R> {
    fn report(&self, event: &ProgressEvent) {
        (**self).report(event)
    }
}

/// Human-readable output on stdout
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleReporter {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::stdout()
    }
}

impl ProgressReporter for ConsoleReporter {
    fn report(&self, event: &ProgressEvent) {
        let symbol = match event.phase {
            Phase::Starting => "→",
            Phase::Completed => "✓",
            Phase::Failed => "✗",
            Phase::Warning => "!",
            Phase::Skipped => "-",
        };
        let line = if event.message.is_empty() {
            format!("{} {}", symbol, event.step)
        } else {
            format!("{} {}: {}", symbol, event.step, event.message)
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
    }
}

/// Structured `tracing` events, one per progress event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: &ProgressEvent) {
        let step = event.step.as_str();
        let message = event.message.as_str();
        match event.phase {
            Phase::Starting | Phase::Completed | Phase::Skipped => {
                tracing::info!(step, phase = %event.phase, "{}", message)
            }
            Phase::Warning => tracing::warn!(step, phase = %event.phase, "{}", message),
            Phase::Failed => tracing::error!(step, phase = %event.phase, "{}", message),
        }
    }
}

/// Forwards events over a channel to a front-end thread.
///
/// A disconnected receiver is ignored; the installation does not depend on
/// anyone watching it.
pub struct ChannelReporter {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelReporter {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event.clone());
        }
    }
}

/// Fan-out to several reporters, in insertion order
#[derive(Default)]
pub struct MultiReporter {
    sinks: Vec<Box<dyn ProgressReporter + Sync>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: impl ProgressReporter + Sync + 'static) -> Self {
        self.sinks.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ProgressReporter for MultiReporter {
    fn report(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.report(event);
        }
    }
}
