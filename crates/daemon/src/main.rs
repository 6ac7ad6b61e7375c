//! Expect Helper
//!
//! Reads a startup handshake on stdin, starts the command on a pty and
//! serves the session directory until the command terminates.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use daemon::config::{DEFAULT_SHELL, DEFAULT_WAKE_INTERVAL_MS};
use daemon::{Server, ServerOptions};
use protocol::{readiness_line, FileLocks, Handshake, SessionLayout};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter.
const LOG_LEVEL_ENV: &str = "EXPECT_LOG_LEVEL";

/// Expect helper - supervises one interactive child process.
#[derive(Parser, Debug)]
#[command(name = "expect-helper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding session directories
    #[arg(long, value_name = "DIR", default_value_os_t = std::env::temp_dir())]
    pub base_dir: PathBuf,

    /// Upper bound on one loop wake, in milliseconds
    #[arg(long, default_value_t = DEFAULT_WAKE_INTERVAL_MS)]
    pub wake_interval_ms: u64,

    /// Shell used to run the command
    #[arg(long, value_name = "PATH", default_value = DEFAULT_SHELL)]
    pub shell: PathBuf,

    /// Log filter for the server log
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Do not create input and control channels
    #[arg(long)]
    pub passive: bool,
}

impl Cli {
    fn options(&self) -> ServerOptions {
        ServerOptions {
            base_dir: self.base_dir.clone(),
            wake_interval: Duration::from_millis(self.wake_interval_ms),
            shell: self.shell.clone(),
            passive: self.passive,
        }
    }

    fn log_filter(&self) -> EnvFilter {
        if self.verbose {
            return EnvFilter::new("debug");
        }
        EnvFilter::try_from_env(LOG_LEVEL_ENV).unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Send diagnostics to the session's server log.
fn init_tracing(layout: &SessionLayout, filter: EnvFilter) -> WorkerGuard {
    let appender = tracing_appender::rolling::never(layout.dir(), protocol::layout::SERVER_LOG);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = cli.options();
    options.validate()?;

    let handshake = Handshake::read_from(&mut io::stdin().lock())
        .context("Failed to read startup handshake")?;

    let layout = SessionLayout::new(&options.base_dir, &handshake.id);
    std::fs::create_dir_all(layout.dir())
        .with_context(|| format!("Failed to create {}", layout.dir().display()))?;
    let _guard = init_tracing(&layout, cli.log_filter());

    tracing::info!(
        session_id = %handshake.id,
        echo = handshake.echo,
        passive = options.passive,
        "Expect helper starting"
    );

    let server = match Server::start(&handshake, &options, FileLocks::new(&layout)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start session");
            return Err(e.into());
        }
    };

    let mut stdout = io::stdout().lock();
    let announced = writeln!(stdout, "{}", readiness_line(&handshake.id)).and_then(|()| stdout.flush());
    if let Err(e) = announced {
        // the controller gave up waiting; keep serving for anyone attaching
        tracing::warn!(error = %e, "Failed to announce readiness");
    }
    drop(stdout);

    let status = server.run().inspect_err(|e| {
        tracing::error!(error = %e, "Session loop failed");
    })?;
    tracing::info!(status, "Expect helper exiting");
    Ok(())
}
