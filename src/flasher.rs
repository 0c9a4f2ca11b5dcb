//! Firmware flashing through an external programmer executable.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Placeholder replaced by the firmware path in the programmer arguments.
pub const BINARY_PLACEHOLDER: &str = "{binary}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    Success,
    /// The programmer failed; `stdout` holds what it printed, one line per entry.
    Failure { stdout: Vec<String> },
}

impl FlashOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FlashOutcome::Success)
    }
}

pub trait Flasher {
    fn flash(&mut self, binary: &Path) -> Result<FlashOutcome>;
}

// Programmer command line, e.g. st-flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra attempts after a failed run.
    pub retries: u32,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("st-flash"),
            args: ["--connect-under-reset", "--reset", "write", BINARY_PLACEHOLDER, "0x8000000"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retries: 1,
        }
    }
}

pub struct ExternalFlasher {
    config: FlasherConfig,
}

impl ExternalFlasher {
    pub fn new(config: FlasherConfig) -> Self {
        Self { config }
    }

    fn command(&self, binary: &Path) -> Command {
        let mut command = Command::new(&self.config.program);
        for arg in &self.config.args {
            if arg == BINARY_PLACEHOLDER {
                command.arg(binary);
            } else {
                command.arg(arg);
            }
        }
        command
    }
}

// Output lines without carriage returns or blank lines.
fn clean_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(|line| line.replace('\r', ""))
        .filter(|line| !line.trim().is_empty())
        .collect()
}

impl Flasher for ExternalFlasher {
    fn flash(&mut self, binary: &Path) -> Result<FlashOutcome> {
        if !binary.is_file() {
            return Ok(FlashOutcome::Failure {
                stdout: vec![binary.display().to_string(), String::from("Invalid file path")],
            });
        }

        let mut attempt = 0;
        loop {
            let output = self.command(binary).output()?;
            if output.status.success() {
                info!(binary = %binary.display(), "firmware flashed");
                return Ok(FlashOutcome::Success);
            }

            let mut stdout = clean_lines(&output.stdout);
            if let Some(last) = clean_lines(&output.stderr).pop() {
                stdout.push(last);
            }
            warn!(binary = %binary.display(), attempt, status = %output.status, "flashing failed");
            if attempt >= self.config.retries {
                return Ok(FlashOutcome::Failure { stdout });
            }
            attempt += 1;
        }
    }
}
