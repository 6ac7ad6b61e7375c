//! Controller library for the expect helper.
//!
//! A [`Session`] starts `expect-helper`, which runs a command on a
//! pseudo-terminal and keeps serving a session directory after the
//! controller goes away. Everything after the startup handshake goes
//! through that directory:
//!
//! ```text
//!  controller                         expect-helper            child
//!  ----------                         -------------            -----
//!  send / sendline  --> inpipe   -->  forward input    -->  pty
//!  send_control     --> ctrlpipe -->  set terminal mode
//!  read_until       <-- output   <--  log output       <--  pty
//!  attach_tail      <-- outpipe-*<--  fan out
//!  is_alive         ... lock-server-running (held while serving)
//! ```
//!
//! ```no_run
//! # async fn demo() -> client::Result<()> {
//! use std::time::Duration;
//! use client::{Config, ShellSession};
//!
//! let config = Config::load_default().map_err(std::io::Error::other)?;
//! let mut shell = ShellSession::spawn(&config, "/bin/bash --norc", false).await?;
//! let status = shell.cmd_status("test -d /tmp", Duration::from_secs(10)).await?;
//! assert_eq!(status, 0);
//! shell.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod cursor;
pub mod error;
pub mod matcher;
pub mod process;
pub mod run;
pub mod session;
pub mod shell;
pub mod tail;
pub mod text;

pub use config::{Config, ConfigError, HelperConfig, SessionConfig};
pub use error::{ExpectError, Result};
pub use matcher::{MatchMode, Patterns};
pub use protocol::{SessionId, TerminalMode};
pub use run::{run_bg, run_fg, run_tail};
pub use session::{ReadHooks, Session};
pub use shell::ShellSession;
pub use tail::{LineTailOptions, TailListener};
pub use text::strip_console_codes;

pub use nix::sys::signal::Signal;
