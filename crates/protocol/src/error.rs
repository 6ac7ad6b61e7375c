//! Error types for the protocol crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockKind;

/// Protocol error type covering malformed handshakes, control frames and ids.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Identifier errors
    /// Session identifier is empty or contains characters unsafe for a path.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Reader name is empty or contains a separator.
    #[error("invalid reader name: {0:?}")]
    InvalidReaderName(String),

    // Handshake errors
    /// The handshake stream ended before a required field was read.
    #[error("handshake truncated: missing {0}")]
    HandshakeTruncated(&'static str),

    /// The handshake contained bytes that are not valid UTF-8.
    #[error("handshake is not valid utf-8: {0}")]
    HandshakeEncoding(String),

    // Control frame errors
    /// The length prefix of a control frame is not a decimal number.
    #[error("invalid control frame length prefix: {0:?}")]
    InvalidLengthPrefix(String),

    /// Control frame payload exceeds the maximum allowed size.
    #[error("control frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Control keyword does not name a terminal mode.
    #[error("unknown terminal mode: {0:?}")]
    UnknownMode(String),

    /// Underlying I/O failure while reading or writing a protocol stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by the advisory lock capability.
#[derive(Debug, Error)]
pub enum LockError {
    /// A non-blocking acquire found the lock held by someone else.
    #[error("lock unavailable: {0} is held")]
    Unavailable(LockKind),

    /// The lock file could not be opened or locked.
    #[error("lock I/O error on {path}: {source}")]
    Io {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}
