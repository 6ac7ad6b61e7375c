//! Error types for the helper.

use std::path::PathBuf;

use protocol::{LockError, ProtocolError};
use thiserror::Error;

/// Errors that can stop the helper.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The handshake or a control frame was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session lock could not be taken or released.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The child could not be started on a pty.
    #[error("failed to spawn child: {0}")]
    SpawnFailed(String),

    /// A fifo or file in the session directory could not be set up.
    #[error("failed to set up {path}: {source}")]
    Channel {
        /// Path of the channel.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Terminal attributes could not be read or applied.
    #[error("terminal attribute error: {0}")]
    Terminal(#[from] nix::Error),

    /// A command line option is out of range.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    pub(crate) fn channel(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaemonError::Channel {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_failed_display() {
        let err = DaemonError::SpawnFailed("no such file".to_string());
        assert_eq!(err.to_string(), "failed to spawn child: no such file");
    }

    #[test]
    fn test_channel_display() {
        let err = DaemonError::channel(
            "/tmp/x/inpipe",
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exists"),
        );
        assert_eq!(err.to_string(), "failed to set up /tmp/x/inpipe: exists");
    }

    #[test]
    fn test_from_protocol_error() {
        let err: DaemonError = ProtocolError::UnknownMode("x".into()).into();
        assert_eq!(err.to_string(), "unknown terminal mode: \"x\"");
    }
}
