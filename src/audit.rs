//! Persistent audit log
//!
//! Append-only, one human-readable line per step outcome, written as the
//! pipeline progresses so a crash mid-installation still leaves a trail.
//!
//! ```text
//! 1760860800 START attempt target=/dev/sda profile=minimal
//! 1760860812 COMPLETED format
//! 1760860815 FAILED create-users: useradd failed (exit code 9): user exists
//! 1760860816 END Installation failed: ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::state::{PipelineState, StepRecord, unix_timestamp};

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: File,
}

impl AuditLog {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the beginning of an attempt
    pub fn begin(&mut self, description: &str) -> io::Result<()> {
        self.write_line(&format!("{} START {}", unix_timestamp(), description))
    }

    pub fn append(&mut self, record: &StepRecord) -> io::Result<()> {
        self.write_line(&record.to_string())
    }

    /// Write the terminal status line
    pub fn finish(&mut self, state: &PipelineState) -> io::Result<()> {
        let summary = state.summary().replace('\n', " ");
        self.write_line(&format!("{} END {}", unix_timestamp(), summary))
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.file, "{}", line)?;
        self.file.flush()
    }
}
