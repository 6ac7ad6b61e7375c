//! # Expect Helper Library
//!
//! The helper is a small detached process that owns one child running on a
//! pseudo-terminal. Controllers never talk to the child directly; they use
//! the files and fifos the helper keeps in the session directory.
//!
//! ## Overview
//!
//! - **Channels**: output log, input/control fifos and named reader fifos
//! - **PTY Session**: spawning the command and applying terminal modes
//! - **Fan-out**: lossless, non-blocking delivery to every reader
//! - **Event Loop**: the per-wake state machine and ordered shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                       Server                          │
//! │                                                       │
//! │  inpipe ──▶ forward_input ──▶ ┌─────────┐             │
//! │  ctrlpipe ─▶ apply_control ─▶ │   PTY   │ ◀──▶ child  │
//! │                               └────┬────┘             │
//! │                                    ▼ pump_pty         │
//! │                 output log ◀── CR strip ──▶ fan-out   │
//! │                                               │       │
//! │                                  outpipe-<name> ...   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: runtime options
//! - [`channels`]: session files and fifos
//! - [`session`]: pty process and reader fan-out
//! - [`server`]: event loop and shutdown
//! - [`error`]: error types

pub mod channels;
pub mod config;
pub mod error;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use channels::{ChannelSet, OutputLog};
pub use config::ServerOptions;
pub use error::DaemonError;
pub use server::{finish_session, Server};
pub use session::{PtyProcess, ReaderChannel, ReaderFanout, ReaderStats};
