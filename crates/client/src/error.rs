//! Error types for controllers.

use protocol::{LockError, ProtocolError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by session operations.
///
/// Timeouts and terminations carry the output read so far; use
/// [`ExpectError::output`] to get at it uniformly.
#[derive(Debug, Error)]
pub enum ExpectError {
    /// The helper did not announce readiness in time or exited early.
    #[error("helper for session {id} failed to start: {reason}")]
    StartupFailed {
        /// Session identifier.
        id: String,
        /// What went wrong.
        reason: String,
    },

    /// No pattern matched before the deadline.
    #[error("timed out waiting for {patterns:?} (output: {output:?})")]
    Timeout {
        /// Patterns that were searched for.
        patterns: Vec<String>,
        /// Output read before the deadline.
        output: String,
    },

    /// The child terminated before any pattern matched.
    #[error("process terminated while waiting for {patterns:?} (status: {status:?}, output: {output:?})")]
    ProcessTerminated {
        /// Patterns that were searched for.
        patterns: Vec<String>,
        /// Exit status, if the helper recorded one.
        status: Option<i32>,
        /// Output read before termination.
        output: String,
    },

    /// The exit status of a shell command could not be determined.
    #[error("could not get exit status of {command:?} (output: {output:?})")]
    ShellStatus {
        /// The command that was run.
        command: String,
        /// Its output.
        output: String,
    },

    /// A shell command exited with a status outside the accepted set.
    #[error("shell command {command:?} failed with status {status} (output: {output:?})")]
    ShellCommand {
        /// The command that was run.
        command: String,
        /// Its exit status.
        status: i32,
        /// Its output.
        output: String,
    },

    /// The session's helper is not running.
    #[error("session {0} is not running")]
    LockUnavailable(String),

    /// A pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// The session has no reader with this name, or it is already taken.
    #[error("unknown reader: {0}")]
    UnknownReader(String),

    /// The session was started without an input channel.
    #[error("session {0} does not accept input")]
    NotInteractive(String),

    /// The character has no control-key equivalent.
    #[error("no control character for {0:?}")]
    InvalidControlChar(char),

    /// The session has already been closed.
    #[error("session {0} is closed")]
    Closed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExpectError {
    /// Output carried by the error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExpectError::Timeout { output, .. }
            | ExpectError::ProcessTerminated { output, .. }
            | ExpectError::ShellStatus { output, .. }
            | ExpectError::ShellCommand { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExpectError::Timeout { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ExpectError::ProcessTerminated { .. })
    }

    /// Whether the error comes from the shell side of a command: a timeout,
    /// the child exiting, or a missing or nonzero status.
    pub fn is_shell_failure(&self) -> bool {
        matches!(
            self,
            ExpectError::Timeout { .. }
                | ExpectError::ProcessTerminated { .. }
                | ExpectError::ShellStatus { .. }
                | ExpectError::ShellCommand { .. }
        )
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ExpectError>;
