//! Helper runtime options.
//!
//! The helper is always launched by a controller, so its options come from
//! the command line rather than a config file. See `main.rs` for the flags.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::DaemonError;

/// Default upper bound on one loop wake.
pub const DEFAULT_WAKE_INTERVAL_MS: u64 = 50;

/// Shell used to run the command.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Longest accepted wake interval.
const MAX_WAKE_INTERVAL_MS: u64 = 10_000;

/// Options for one helper run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Directory holding session directories.
    pub base_dir: PathBuf,
    /// Upper bound on one poll of the channels.
    pub wake_interval: Duration,
    /// Shell used to run the command.
    pub shell: PathBuf,
    /// Skip the input and control fifos.
    pub passive: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
            wake_interval: Duration::from_millis(DEFAULT_WAKE_INTERVAL_MS),
            shell: PathBuf::from(DEFAULT_SHELL),
            passive: false,
        }
    }
}

impl ServerOptions {
    /// Check that the options describe a runnable helper.
    pub fn validate(&self) -> Result<(), DaemonError> {
        let wake_ms = self.wake_interval.as_millis();
        if wake_ms == 0 || wake_ms > u128::from(MAX_WAKE_INTERVAL_MS) {
            return Err(DaemonError::InvalidOption(format!(
                "wake interval must be between 1 and {MAX_WAKE_INTERVAL_MS} ms, got {wake_ms}"
            )));
        }
        if !self.base_dir.is_dir() {
            return Err(DaemonError::InvalidOption(format!(
                "base directory {} does not exist",
                self.base_dir.display()
            )));
        }
        if self.shell.as_os_str().is_empty() {
            return Err(DaemonError::InvalidOption("shell must not be empty".into()));
        }
        Ok(())
    }
}
