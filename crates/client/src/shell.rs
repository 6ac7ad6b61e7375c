//! Command-oriented wrapper for interactive shells.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{ExpectError, Result};
use crate::matcher::{last_nonempty_line, MatchMode, Patterns};
use crate::session::Session;

/// Re-send interval of [`ShellSession::cmd_output_safe`].
const SAFE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// How long to wait for the prompt that follows a status check.
const PROMPT_SETTLE: Duration = Duration::from_secs(1);

/// Command that prints the exit status of the previous command.
pub const DEFAULT_STATUS_TEST_COMMAND: &str = "echo $?";

/// A [`Session`] running a shell, with prompt-aware command helpers.
///
/// Commands must not contain newlines.
#[derive(Debug)]
pub struct ShellSession {
    session: Session,
    prompt: Regex,
    status_test_command: String,
}

impl ShellSession {
    /// Start `command` (usually a shell or a remote login) and wait briefly
    /// for its first prompt.
    pub async fn spawn(config: &Config, command: &str, echo: bool) -> Result<Self> {
        let session = Session::spawn(config, command, echo, &[]).await?;
        let mut shell = Self::from_session(session)?;
        let wait = config.session.responsive_timeout();
        match shell.read_up_to_prompt(wait).await {
            Ok(_) => {}
            Err(e) if e.is_timeout() => {
                tracing::debug!(session_id = %shell.id(), "No initial prompt within {wait:?}");
            }
            Err(e) => return Err(e),
        }
        Ok(shell)
    }

    /// Wrap an existing session, using the configured prompt.
    pub fn from_session(session: Session) -> Result<Self> {
        let prompt = compile(&session.config().session.prompt)?;
        Ok(Self {
            session,
            prompt,
            status_test_command: DEFAULT_STATUS_TEST_COMMAND.to_string(),
        })
    }

    pub fn into_inner(self) -> Session {
        self.session
    }

    pub fn prompt(&self) -> &Regex {
        &self.prompt
    }

    pub fn set_prompt(&mut self, prompt: &str) -> Result<()> {
        self.prompt = compile(prompt)?;
        Ok(())
    }

    pub fn status_test_command(&self) -> &str {
        &self.status_test_command
    }

    /// Set the command sent after each command to print its exit status,
    /// for shells where `echo $?` does not.
    pub fn set_status_test_command(&mut self, command: impl Into<String>) {
        self.status_test_command = command.into();
    }

    /// Read until the last non-empty line matches the prompt.
    pub async fn read_up_to_prompt(&mut self, timeout: Duration) -> Result<String> {
        let patterns = Patterns::new([self.prompt.as_str()])?;
        let (_, output) = self
            .session
            .read_until(&patterns, MatchMode::LastLine, timeout)
            .await?;
        Ok(output)
    }

    /// Send `cmd` and return its output without the echoed command and the
    /// final prompt.
    pub async fn cmd_output(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        tracing::debug!(session_id = %self.id(), cmd, "Sending command");
        self.session.drain().await?;
        self.session.sendline(cmd).await?;
        let output = self
            .read_up_to_prompt(timeout)
            .await
            .map_err(|e| strip_echo_from_error(e, cmd))?;
        Ok(remove_last_nonempty_line(&remove_command_echo(&output, cmd)))
    }

    /// Like [`cmd_output`](Self::cmd_output), but keeps poking the shell
    /// with empty lines until the prompt shows up. Useful on consoles where
    /// unrelated messages can hide the prompt.
    pub async fn cmd_output_safe(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        tracing::debug!(session_id = %self.id(), cmd, "Sending command (safe)");
        self.session.drain().await?;
        self.session.sendline(cmd).await?;

        let deadline = Instant::now() + timeout;
        let mut output = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ExpectError::Timeout {
                    patterns: vec![self.prompt.as_str().to_string()],
                    output: remove_command_echo(&output, cmd),
                });
            }
            match self.read_up_to_prompt(remaining.min(SAFE_RETRY_INTERVAL)).await {
                Ok(text) => {
                    output.push_str(&text);
                    break;
                }
                Err(ExpectError::Timeout { output: text, .. }) => {
                    output.push_str(&text);
                    self.session.sendline("").await?;
                }
                Err(e) => return Err(strip_echo_from_error(e, cmd)),
            }
        }
        Ok(remove_last_nonempty_line(&remove_command_echo(&output, cmd)))
    }

    /// Send `cmd` followed by the status test command and return the exit
    /// status and output of `cmd`.
    pub async fn cmd_status_output(&mut self, cmd: &str, timeout: Duration) -> Result<(i32, String)> {
        let check = StatusCheck::new()?;
        let deadline = Instant::now() + timeout;

        self.session.drain().await?;
        self.session.sendline(cmd).await?;
        self.session
            .sendline(&check.command(&self.status_test_command))
            .await?;

        let patterns = Patterns::new([check.pattern.as_str()])?;
        let (_, text) = self
            .session
            .read_until(&patterns, MatchMode::FreeText, timeout)
            .await
            .map_err(|e| strip_echo_from_error(e, cmd))?;

        let Some(report) = check.parse(&text) else {
            return Err(ExpectError::ShellStatus {
                command: cmd.to_string(),
                output: remove_command_echo(&text, cmd),
            });
        };

        let body = strip_check_line(&text[..report.start], &check.marker, &self.prompt);
        let output = remove_command_echo(body, cmd);

        let Some(status) = report.status else {
            return Err(ExpectError::ShellStatus {
                command: cmd.to_string(),
                output,
            });
        };

        let trailing = &text[report.end..];
        if !last_nonempty_line(trailing).is_some_and(|line| self.prompt.is_match(line)) {
            let settle = deadline
                .saturating_duration_since(Instant::now())
                .min(PROMPT_SETTLE);
            if let Err(e) = self.read_up_to_prompt(settle).await {
                tracing::debug!(session_id = %self.id(), error = %e, "No prompt after status check");
            }
        }

        Ok((status, output))
    }

    /// Exit status of `cmd`.
    pub async fn cmd_status(&mut self, cmd: &str, timeout: Duration) -> Result<i32> {
        Ok(self.cmd_status_output(cmd, timeout).await?.0)
    }

    /// Output of `cmd`, failing with [`ExpectError::ShellCommand`] on a
    /// nonzero exit status.
    pub async fn cmd(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        self.cmd_with_ok_status(cmd, timeout, &[0]).await
    }

    /// Output of `cmd`, failing unless its exit status is in `ok_status`.
    pub async fn cmd_with_ok_status(
        &mut self,
        cmd: &str,
        timeout: Duration,
        ok_status: &[i32],
    ) -> Result<String> {
        let (status, output) = self.cmd_status_output(cmd, timeout).await?;
        if !ok_status.contains(&status) {
            return Err(ExpectError::ShellCommand {
                command: cmd.to_string(),
                status,
                output,
            });
        }
        Ok(output)
    }

    /// Like [`cmd`](Self::cmd), but a command that fails, hangs or takes
    /// the shell down yields `None` instead of an error.
    pub async fn cmd_ignoring_errors(&mut self, cmd: &str, timeout: Duration) -> Result<Option<String>> {
        match self.cmd(cmd, timeout).await {
            Ok(output) => Ok(Some(output)),
            Err(e) if e.is_shell_failure() => {
                tracing::debug!(session_id = %self.id(), cmd, error = %e, "Ignoring command failure");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the shell answers an empty line with a prompt within
    /// `timeout`.
    pub async fn is_responsive(&mut self, timeout: Duration) -> bool {
        if !self.session.is_alive() {
            return false;
        }
        if self.session.drain().await.is_err() || self.session.sendline("").await.is_err() {
            return false;
        }
        self.read_up_to_prompt(timeout).await.is_ok()
    }
}

impl Deref for ShellSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl DerefMut for ShellSession {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

fn compile(prompt: &str) -> Result<Regex> {
    Regex::new(prompt).map_err(|e| ExpectError::InvalidPattern {
        pattern: prompt.to_string(),
        reason: e.to_string(),
    })
}

/// Drop the first line if it is the echoed `cmd`.
pub fn remove_command_echo(text: &str, cmd: &str) -> String {
    match text.split_once('\n') {
        Some((first, rest)) if first.trim_end_matches('\r') == cmd => rest.to_string(),
        None if text.trim_end_matches('\r') == cmd => String::new(),
        _ => text.to_string(),
    }
}

/// Drop the last non-empty line and everything after it.
pub fn remove_last_nonempty_line(text: &str) -> String {
    let trimmed = text.trim_end();
    match trimmed.rfind('\n') {
        Some(index) => trimmed[..=index].to_string(),
        None => String::new(),
    }
}

/// Drop the last line of `body` if it is a prompt, possibly followed by the
/// echoed status check.
fn strip_check_line<'a>(body: &'a str, marker: &str, prompt: &Regex) -> &'a str {
    let content = body.trim_end_matches('\n');
    let (head, last) = match content.rfind('\n') {
        Some(index) => (&content[..=index], &content[index + 1..]),
        None => ("", content),
    };
    if last.contains(marker) || prompt.is_match(last) {
        head
    } else {
        body
    }
}

fn strip_echo_from_error(error: ExpectError, cmd: &str) -> ExpectError {
    match error {
        ExpectError::Timeout { patterns, output } => ExpectError::Timeout {
            patterns,
            output: remove_command_echo(&output, cmd),
        },
        ExpectError::ProcessTerminated {
            patterns,
            status,
            output,
        } => ExpectError::ProcessTerminated {
            patterns,
            status,
            output: remove_command_echo(&output, cmd),
        },
        other => other,
    }
}

/// A one-off line running the status test command, then printing a
/// unique marker on a line of its own.
#[derive(Debug, Clone)]
struct StatusCheck {
    marker: String,
    pattern: Regex,
}

/// Where the status check's answer sits in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatusReport {
    start: usize,
    end: usize,
    status: Option<i32>,
}

impl StatusCheck {
    fn new() -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self::with_marker(format!("EXPECT_STATUS_{}", &id[..12]))
    }

    fn with_marker(marker: String) -> Result<Self> {
        // the echoed command line has a quote after the marker; without
        // echo, a silent status command leaves the marker after the prompt
        let pattern = compile(&format!("([^\\n]*?)\\n?{}\\n", regex::escape(&marker)))?;
        Ok(Self { marker, pattern })
    }

    fn command(&self, status_test_command: &str) -> String {
        format!("{status_test_command}; printf '%s\\n' '{}'", self.marker)
    }

    /// The status is the last word of the line before the marker, which
    /// may also carry a prompt.
    fn parse(&self, text: &str) -> Option<StatusReport> {
        let caps = self.pattern.captures(text)?;
        let whole = caps.get(0)?;
        let status = caps
            .get(1)
            .and_then(|m| m.as_str().split_whitespace().next_back())
            .and_then(|word| word.parse().ok());
        Some(StatusReport {
            start: whole.start(),
            end: whole.end(),
            status,
        })
    }
}
