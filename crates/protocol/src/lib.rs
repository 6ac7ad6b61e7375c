//! # Session Protocol Library
//!
//! Shared definitions for the expect helper (`expect-helper`) and the
//! controllers that drive it.
//!
//! ## Overview
//!
//! A session lives entirely in a directory on disk. This crate defines:
//!
//! - **Layout**: the names of every file and fifo in a session directory
//! - **Handshake**: the startup parameters a controller hands the helper
//! - **Control Frames**: length-prefixed terminal mode requests
//! - **Locks**: the two advisory locks that order startup and shutdown
//!
//! ## Architecture
//!
//! ```text
//!  controller ──inpipe────────▶ ┌────────┐ ──pty──▶ child
//!  controller ──ctrlpipe──────▶ │ helper │
//!  controller ◀─output log───── │        │ ◀─pty─── child
//!  listener   ◀─outpipe-<name>─ └────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Handshake, SessionId, SessionLayout, TerminalMode};
//! use std::path::Path;
//!
//! let id = SessionId::generate();
//! let layout = SessionLayout::new(Path::new("/tmp"), &id);
//! assert!(layout.dir().ends_with(format!("aexpect_{id}")));
//!
//! let handshake = Handshake::new(id, false, vec!["tail".into()], "ls");
//! let bytes = handshake.encode();
//! assert!(bytes.ends_with(b"tail\nls\n"));
//!
//! assert_eq!(TerminalMode::Raw.to_frame(), b"         3raw");
//! ```
//!
//! ## Modules
//!
//! - [`layout`]: session ids and directory layout
//! - [`handshake`]: startup handshake and readiness line
//! - [`control`]: control frame codec
//! - [`lock`]: lock capability and implementations
//! - [`error`]: Error types

pub mod control;
pub mod error;
pub mod handshake;
pub mod layout;
pub mod lock;

pub use control::{ControlCodec, TerminalMode, LENGTH_PREFIX_WIDTH, MAX_CONTROL_PAYLOAD};
pub use error::{LockError, ProtocolError, Result};
pub use handshake::{is_readiness_line, readiness_line, Handshake};
pub use layout::{validate_reader_name, SessionId, SessionLayout, SESSION_DIR_PREFIX};
pub use lock::{FileLockHandle, FileLocks, LockKind, MemoryLockHandle, MemoryLocks, SessionLocks};
