//! One-call helpers for background and foreground commands.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::Config;
use crate::error::Result;
use crate::session::Session;

/// Reader fifo the runners attach their line listener to.
pub const TAIL_READER: &str = "tail";

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Run `command` without an input channel, passing each output line
/// (prefixed) to `on_line` and the exit status to `on_exit`.
///
/// Returns once the command exits or `timeout` elapses, whichever comes
/// first; the session keeps running in the latter case.
pub async fn run_tail<F, G>(
    config: &Config,
    command: &str,
    prefix: &str,
    on_line: F,
    on_exit: G,
    timeout: Duration,
) -> Result<Session>
where
    F: FnMut(&str) + Send + 'static,
    G: FnOnce(i32) + Send + 'static,
{
    let session = Session::spawn_passive(config, command, &[TAIL_READER]).await?;
    follow(session, prefix, on_line, on_exit, timeout).await
}

/// Like [`run_tail`], but the returned session accepts input.
pub async fn run_bg<F, G>(
    config: &Config,
    command: &str,
    prefix: &str,
    on_line: F,
    on_exit: G,
    timeout: Duration,
) -> Result<Session>
where
    F: FnMut(&str) + Send + 'static,
    G: FnOnce(i32) + Send + 'static,
{
    let session = Session::spawn(config, command, false, &[TAIL_READER]).await?;
    follow(session, prefix, on_line, on_exit, timeout).await
}

/// Run `command` for at most `timeout` and return its exit status and
/// output. The status is `None` if the command was still running; it is
/// killed in that case.
pub async fn run_fg(config: &Config, command: &str, timeout: Duration) -> Result<(Option<i32>, String)> {
    let mut session = run_bg(config, command, "", |_| {}, |_| {}, timeout).await?;
    let status = if session.is_alive() {
        None
    } else {
        session.get_status().await?
    };
    let output = session.get_output().await?;
    session.close().await?;
    Ok((status, output))
}

async fn follow<F, G>(
    mut session: Session,
    prefix: &str,
    on_line: F,
    on_exit: G,
    timeout: Duration,
) -> Result<Session>
where
    F: FnMut(&str) + Send + 'static,
    G: FnOnce(i32) + Send + 'static,
{
    session.attach_line_tail(TAIL_READER, prefix, on_line, on_exit)?;
    let deadline = Instant::now() + timeout;
    while session.is_alive() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(LIVENESS_POLL.min(deadline - now)).await;
    }
    Ok(session)
}
