//! Controller handle on one supervised child.
//!
//! A [`Session`] starts (or attaches to) a helper and then talks to it only
//! through the session directory: input and control frames go into fifos,
//! output is read back from the log, and liveness comes from the
//! server-running lock.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::Signal;
use protocol::{
    is_readiness_line, validate_reader_name, FileLocks, Handshake, LockKind, SessionId,
    SessionLayout, SessionLocks, TerminalMode,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

use crate::config::Config;
use crate::cursor::LogCursor;
use crate::error::{ExpectError, Result};
use crate::matcher::{MatchMode, Patterns};
use crate::process;
use crate::tail::{open_reader, LineTailOptions, TailListener};
use crate::text::{self, TextDecoder};

/// Optional callbacks of [`Session::read_until_with`].
#[derive(Default)]
pub struct ReadHooks<'a> {
    /// Applied to the accumulated output before every match attempt.
    pub filter: Option<&'a dyn Fn(&str) -> String>,
    /// Called with each line of output as it is read.
    pub print: Option<&'a mut dyn FnMut(&str)>,
}

/// A live or finished child process under a helper.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    layout: SessionLayout,
    locks: FileLocks,
    config: Config,
    echo: bool,
    linesep: String,
    interactive: bool,
    cursor: LogCursor,
    decoder: TextDecoder,
    log_file: Option<PathBuf>,
    readers: HashMap<String, pipe::Receiver>,
    listeners: Vec<TailListener>,
    helper: Option<Child>,
    closed: bool,
}

impl Session {
    /// Start `command` under a new helper.
    ///
    /// `readers` names the extra fifos that receive a copy of all output.
    /// Fails with [`ExpectError::StartupFailed`] if the helper does not
    /// announce readiness within the handshake timeout; nothing is left
    /// behind in that case.
    pub async fn spawn(config: &Config, command: &str, echo: bool, readers: &[&str]) -> Result<Self> {
        Self::launch(config, command, echo, readers, false).await
    }

    /// Start `command` without input or control channels.
    pub async fn spawn_passive(config: &Config, command: &str, readers: &[&str]) -> Result<Self> {
        Self::launch(config, command, false, readers, true).await
    }

    async fn launch(
        config: &Config,
        command: &str,
        echo: bool,
        readers: &[&str],
        passive: bool,
    ) -> Result<Self> {
        config.validate()?;
        for name in readers {
            validate_reader_name(name)?;
        }

        let id = SessionId::generate();
        let layout = SessionLayout::new(&config.session.base_dir, &id);
        tokio::fs::create_dir_all(layout.dir()).await?;
        let locks = FileLocks::new(&layout);
        let starting = locks.acquire(LockKind::ClientStarting)?;

        let handshake = Handshake::new(
            id.clone(),
            echo,
            readers.iter().map(|name| name.to_string()).collect(),
            command,
        );

        let mut helper = match start_helper(config, passive) {
            Ok(helper) => helper,
            Err(e) => {
                drop(starting);
                remove_session_dir(layout.dir()).await;
                return Err(ExpectError::StartupFailed {
                    id: id.to_string(),
                    reason: format!("failed to run {}: {e}", config.helper_path().display()),
                });
            }
        };

        let window = config.session.handshake_timeout();
        let outcome = match timeout(window, perform_handshake(&mut helper, &handshake)).await {
            Ok(Ok(())) => open_readers(&layout, readers).map_err(|e| e.to_string()),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(format!("no readiness line within {window:?}")),
        };

        let receivers = match outcome {
            Ok(receivers) => receivers,
            Err(reason) => {
                tracing::warn!(session_id = %id, %reason, "Helper failed to start");
                abort_helper(&mut helper, &layout).await;
                drop(starting);
                remove_session_dir(layout.dir()).await;
                return Err(ExpectError::StartupFailed {
                    id: id.to_string(),
                    reason,
                });
            }
        };

        locks.release(starting)?;
        tracing::info!(session_id = %id, pid = ?layout.read_pid(), "Session ready");

        Ok(Self {
            id,
            cursor: LogCursor::new(layout.output_file()),
            decoder: TextDecoder::new(config.session.encoding()),
            log_file: None,
            layout,
            locks,
            config: config.clone(),
            echo,
            linesep: config.session.linesep.clone(),
            interactive: !passive,
            readers: receivers,
            listeners: Vec::new(),
            helper: Some(helper),
            closed: false,
        })
    }

    /// Attach to a session another controller started.
    ///
    /// Reads start at the current end of the log. `echo` records whether
    /// the session was started with terminal echo. Fails with
    /// [`ExpectError::LockUnavailable`] if its helper is not running.
    pub async fn attach(config: &Config, id: &str, echo: bool, readers: &[&str]) -> Result<Self> {
        config.validate()?;
        let id = SessionId::parse(id)?;
        let layout = SessionLayout::new(&config.session.base_dir, &id);
        let locks = FileLocks::new(&layout);

        if !layout.dir().is_dir() || !locks.is_held(LockKind::ServerRunning)? {
            return Err(ExpectError::LockUnavailable(id.to_string()));
        }

        let starting = locks.acquire(LockKind::ClientStarting)?;
        let receivers = readers
            .iter()
            .map(|name| {
                validate_reader_name(name)?;
                if !layout.reader_pipe(name).exists() {
                    return Err(ExpectError::UnknownReader(name.to_string()));
                }
                Ok((name.to_string(), open_reader(&layout, name)?))
            })
            .collect::<Result<HashMap<_, _>>>();
        locks.release(starting)?;
        let receivers = receivers?;

        let mut cursor = LogCursor::new(layout.output_file());
        cursor.skip_to_end().await?;

        tracing::info!(session_id = %id, "Attached to session");

        Ok(Self {
            interactive: layout.input_pipe().exists(),
            id,
            cursor,
            decoder: TextDecoder::new(config.session.encoding()),
            log_file: None,
            layout,
            locks,
            config: config.clone(),
            echo,
            linesep: config.session.linesep.clone(),
            readers: receivers,
            listeners: Vec::new(),
            helper: None,
            closed: false,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    pub fn linesep(&self) -> &str {
        &self.linesep
    }

    pub fn set_linesep(&mut self, linesep: impl Into<String>) {
        self.linesep = linesep.into();
    }

    /// File that line tails attached from now on also append to.
    pub fn set_log_file(&mut self, path: impl Into<PathBuf>) {
        self.log_file = Some(path.into());
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ExpectError::Closed(self.id.to_string()));
        }
        Ok(())
    }

    // Input

    /// Write bytes to the child's terminal.
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_open()?;
        if !self.interactive {
            return Err(ExpectError::NotInteractive(self.id.to_string()));
        }
        let mut sender = pipe::OpenOptions::new().open_sender(self.layout.input_pipe())?;
        sender.write_all(data.as_ref()).await?;
        Ok(())
    }

    /// Write text to the child's terminal in the session's encoding.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(text::encode(self.decoder.encoding(), text)).await
    }

    /// Write `line` followed by the line separator.
    pub async fn sendline(&self, line: &str) -> Result<()> {
        self.send_text(&format!("{line}{}", self.linesep)).await
    }

    /// Send the control character for `key`, e.g. `'c'` for Ctrl-C.
    pub async fn send_ctrl_char(&self, key: char) -> Result<()> {
        let byte = control_byte(key).ok_or(ExpectError::InvalidControlChar(key))?;
        self.send([byte]).await
    }

    /// Ask the helper to switch the terminal mode.
    pub async fn send_control(&self, mode: TerminalMode) -> Result<()> {
        self.ensure_open()?;
        if !self.interactive {
            return Err(ExpectError::NotInteractive(self.id.to_string()));
        }
        let mut sender = pipe::OpenOptions::new().open_sender(self.layout.control_pipe())?;
        sender.write_all(&mode.to_frame()).await?;
        Ok(())
    }

    // Output

    /// Read new output until a pattern matches.
    ///
    /// Returns the index of the matching pattern and all output consumed by
    /// this call. The deadline is fixed on entry.
    pub async fn read_until(
        &mut self,
        patterns: &Patterns,
        mode: MatchMode,
        timeout: Duration,
    ) -> Result<(usize, String)> {
        self.read_until_with(patterns, mode, timeout, ReadHooks::default())
            .await
    }

    /// [`read_until`](Self::read_until) with a filter applied before
    /// matching and a callback seeing each line read.
    pub async fn read_until_with(
        &mut self,
        patterns: &Patterns,
        mode: MatchMode,
        timeout: Duration,
        mut hooks: ReadHooks<'_>,
    ) -> Result<(usize, String)> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let poll = self.config.session.poll_interval();
        let mut output = String::new();

        loop {
            let chunk = self.cursor.read_new().await?;
            let grew = !chunk.is_empty();
            if grew {
                let text = self.decoder.decode(&chunk);
                if let Some(index) = hooks.consume(&mut output, &text, patterns, mode) {
                    return Ok((index, output));
                }
            }

            if !grew && !self.locks.is_held(LockKind::ServerRunning)? {
                // the log is final once the helper is gone
                let rest = self.cursor.read_new().await?;
                let text = self.decoder.finish(&rest);
                if let Some(index) = hooks.consume(&mut output, &text, patterns, mode) {
                    return Ok((index, output));
                }
                return Err(ExpectError::ProcessTerminated {
                    patterns: patterns.sources().to_vec(),
                    status: self.layout.read_status(),
                    output,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ExpectError::Timeout {
                    patterns: patterns.sources().to_vec(),
                    output,
                });
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    /// [`read_until`](Self::read_until) in [`MatchMode::FreeText`].
    pub async fn read_until_output_matches(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<(usize, String)> {
        let patterns = Patterns::new(patterns)?;
        self.read_until(&patterns, MatchMode::FreeText, timeout).await
    }

    /// [`read_until`](Self::read_until) in [`MatchMode::LastLine`].
    pub async fn read_until_last_line_matches(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<(usize, String)> {
        let patterns = Patterns::new(patterns)?;
        self.read_until(&patterns, MatchMode::LastLine, timeout).await
    }

    /// [`read_until`](Self::read_until) in [`MatchMode::LastWord`].
    pub async fn read_until_last_word_matches(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<(usize, String)> {
        let patterns = Patterns::new(patterns)?;
        self.read_until(&patterns, MatchMode::LastWord, timeout).await
    }

    /// [`read_until`](Self::read_until) in [`MatchMode::AnyLine`].
    pub async fn read_until_any_line_matches(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<(usize, String)> {
        let patterns = Patterns::new(patterns)?;
        self.read_until(&patterns, MatchMode::AnyLine, timeout).await
    }

    /// Read output until none has arrived for `idle` or `timeout` elapsed.
    ///
    /// A character cut short by the end of the read is kept for the next
    /// one, unless the helper has finished.
    pub async fn read_nonblocking(&mut self, idle: Duration, timeout: Duration) -> Result<String> {
        self.ensure_open()?;
        let start = Instant::now();
        let deadline = start + timeout;
        let poll = self.config.session.poll_interval();
        let mut window = Vec::new();
        let mut last_data = start;

        loop {
            let chunk = self.cursor.read_new().await?;
            let now = Instant::now();
            if !chunk.is_empty() {
                window.extend_from_slice(&chunk);
                last_data = now;
            }
            let quiet_until = last_data + idle;
            if now >= deadline || now >= quiet_until {
                break;
            }
            sleep(poll.min(deadline - now).min(quiet_until - now)).await;
        }
        if self.server_running() {
            return Ok(self.decoder.decode(&window));
        }
        window.extend_from_slice(&self.cursor.read_new().await?);
        Ok(self.decoder.finish(&window))
    }

    /// Consume whatever output is already in the log.
    pub async fn drain(&mut self) -> Result<String> {
        self.read_nonblocking(Duration::ZERO, Duration::ZERO).await
    }

    /// The entire output log, independent of the read cursor.
    pub async fn get_output(&self) -> Result<String> {
        match tokio::fs::read(self.layout.output_file()).await {
            Ok(data) => Ok(text::decode_all(self.decoder.encoding(), &data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// [`get_output`](Self::get_output) without console escape sequences.
    pub async fn get_stripped_output(&self) -> Result<String> {
        Ok(text::strip_console_codes(&self.get_output().await?))
    }

    /// Take ownership of a reader fifo opened at startup.
    ///
    /// The helper process lingers after the child exits until the returned
    /// stream is read to its end or dropped.
    pub fn take_reader(&mut self, name: &str) -> Result<pipe::Receiver> {
        self.readers
            .remove(name)
            .ok_or_else(|| ExpectError::UnknownReader(name.to_string()))
    }

    /// Forward a reader fifo to callbacks in the background. `on_exit`
    /// receives the exit status once the stream ends, if one was recorded.
    pub fn attach_tail<F, G>(&mut self, name: &str, on_output: F, on_exit: G) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
        G: FnOnce(i32) + Send + 'static,
    {
        let receiver = self.take_reader(name)?;
        let listener =
            TailListener::spawn(name, receiver, self.layout.status_file(), on_output, on_exit);
        self.listeners.push(listener);
        Ok(())
    }

    /// Forward a reader fifo line by line, each line prefixed and also
    /// appended to the log file if one is set. See
    /// [`TailListener::spawn_lines`].
    pub fn attach_line_tail<F, G>(
        &mut self,
        name: &str,
        prefix: &str,
        on_line: F,
        on_exit: G,
    ) -> Result<()>
    where
        F: FnMut(&str) + Send + 'static,
        G: FnOnce(i32) + Send + 'static,
    {
        let receiver = self.take_reader(name)?;
        let options = LineTailOptions {
            prefix: prefix.to_string(),
            log_file: self.log_file.clone(),
            encoding: self.decoder.encoding(),
        };
        let listener = TailListener::spawn_lines(
            name,
            receiver,
            self.layout.status_file(),
            options,
            on_line,
            on_exit,
        );
        self.listeners.push(listener);
        Ok(())
    }

    // Process state

    /// Pid of the child, once the helper has recorded it.
    pub fn get_pid(&self) -> Option<u32> {
        self.layout.read_pid()
    }

    /// Wait for the helper to finish and return the child's exit status.
    pub async fn get_status(&self) -> Result<Option<i32>> {
        self.wait_for_server().await?;
        Ok(self.layout.read_status())
    }

    /// Whether the helper is running.
    pub fn server_running(&self) -> bool {
        match self.locks.is_held(LockKind::ServerRunning) {
            Ok(held) => held,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Lock check failed");
                false
            }
        }
    }

    /// Whether the helper is running and the child has not exited.
    pub fn is_alive(&self) -> bool {
        self.server_running() && self.get_pid().is_some_and(process::is_running)
    }

    /// Whether a process in the child's tree is a zombie.
    pub fn is_defunct(&self) -> bool {
        self.get_pid().is_some_and(process::tree_has_zombie)
    }

    /// Send a line separator and report whether any output comes back
    /// within `timeout`.
    pub async fn is_responsive(&mut self, timeout: Duration) -> bool {
        if !self.is_alive() {
            return false;
        }
        if self.drain().await.is_err() || self.sendline("").await.is_err() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let poll = self.config.session.poll_interval();
        loop {
            match self.drain().await {
                Ok(text) if !text.trim().is_empty() => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    /// Signal the child and all of its descendants, if still alive.
    pub fn kill(&self, signal: Signal) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.get_pid() {
            tracing::debug!(session_id = %self.id, pid, ?signal, "Killing process tree");
            process::kill_tree(pid, signal);
        }
    }

    async fn wait_for_server(&self) -> Result<()> {
        let locks = self.locks.clone();
        tokio::task::spawn_blocking(move || locks.wait_until_free(LockKind::ServerRunning))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }

    /// Kill the child with SIGKILL and clean up. See
    /// [`close_with`](Self::close_with).
    pub async fn close(&mut self) -> Result<()> {
        self.close_with(Signal::SIGKILL).await
    }

    /// Kill the child with `signal`, drop unclaimed readers, wait for the
    /// helper to exit, join the tail listeners and remove the session
    /// directory. Closing twice is a no-op.
    pub async fn close_with(&mut self, signal: Signal) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.kill(signal);
        // the helper keeps writing to a reader until its consumer is gone
        self.readers.clear();
        self.wait_for_server().await?;

        for listener in self.listeners.drain(..) {
            listener.join().await;
        }

        if let Some(mut helper) = self.helper.take() {
            if let Err(e) = helper.wait().await {
                tracing::debug!(session_id = %self.id, error = %e, "Failed to reap helper");
            }
        }

        self.closed = true;
        if !self.config.session.keep_files {
            remove_session_dir(self.layout.dir()).await;
        }
        tracing::debug!(session_id = %self.id, "Session closed");
        Ok(())
    }
}

impl ReadHooks<'_> {
    /// Add newly read text to `output` and match the result.
    fn consume(
        &mut self,
        output: &mut String,
        text: &str,
        patterns: &Patterns,
        mode: MatchMode,
    ) -> Option<usize> {
        if let Some(print) = self.print.as_mut() {
            for line in text.lines() {
                (*print)(line);
            }
        }
        output.push_str(text);
        let filtered = match self.filter {
            Some(filter) => Cow::Owned(filter(output.as_str())),
            None => Cow::Borrowed(output.as_str()),
        };
        patterns.find(&filtered, mode)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed || !self.config.session.auto_close {
            return;
        }
        self.kill(Signal::SIGKILL);
        if self.config.session.keep_files {
            return;
        }
        let locks = self.locks.clone();
        let dir = self.layout.dir().to_path_buf();
        std::thread::spawn(move || {
            if locks.wait_until_free(LockKind::ServerRunning).is_ok() {
                let _ = std::fs::remove_dir_all(dir);
            }
        });
    }
}

/// Control byte for `key`: letters map to 1-26, punctuation per the ASCII
/// caret notation.
pub fn control_byte(key: char) -> Option<u8> {
    match key.to_ascii_lowercase() {
        c @ 'a'..='z' => Some(c as u8 - b'a' + 1),
        '@' | '`' => Some(0),
        '[' | '{' => Some(27),
        '\\' | '|' => Some(28),
        ']' | '}' => Some(29),
        '^' | '~' => Some(30),
        '_' => Some(31),
        '?' => Some(127),
        _ => None,
    }
}

fn start_helper(config: &Config, passive: bool) -> io::Result<Child> {
    let mut command = Command::new(config.helper_path());
    command
        .arg("--base-dir")
        .arg(&config.session.base_dir)
        .arg("--wake-interval-ms")
        .arg(config.helper.wake_interval_ms.to_string())
        .arg("--shell")
        .arg(&config.helper.shell)
        .arg("--log-level")
        .arg(&config.helper.log_level)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0);
    if passive {
        command.arg("--passive");
    }
    command.spawn()
}

/// Send the handshake and wait for the readiness line.
async fn perform_handshake(helper: &mut Child, handshake: &Handshake) -> std::result::Result<(), String> {
    let mut stdin = helper
        .stdin
        .take()
        .ok_or_else(|| "helper stdin unavailable".to_string())?;
    if let Err(e) = stdin.write_all(&handshake.encode()).await {
        // an early exit shows up below along with whatever it printed
        tracing::debug!(session_id = %handshake.id, error = %e, "Failed to send handshake");
    }
    drop(stdin);

    let stdout = helper
        .stdout
        .take()
        .ok_or_else(|| "helper stdout unavailable".to_string())?;
    let mut lines = BufReader::new(stdout).lines();
    let mut transcript = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("failed to read helper output: {e}"))?
    {
        if is_readiness_line(&line, &handshake.id) {
            return Ok(());
        }
        transcript.push(line);
    }
    Err(format!(
        "helper exited before becoming ready (output: {:?})",
        transcript.join("\n")
    ))
}

fn open_readers(layout: &SessionLayout, names: &[&str]) -> io::Result<HashMap<String, pipe::Receiver>> {
    names
        .iter()
        .map(|name| Ok((name.to_string(), open_reader(layout, name)?)))
        .collect()
}

/// Tear down a helper that never became ready, and its child if it got
/// that far.
async fn abort_helper(helper: &mut Child, layout: &SessionLayout) {
    if let Some(pid) = layout.read_pid() {
        process::kill_tree(pid, Signal::SIGKILL);
    }
    if let Err(e) = helper.start_kill() {
        tracing::debug!(error = %e, "Helper already gone");
    }
    let _ = helper.wait().await;
}

async fn remove_session_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove session directory"),
    }
}
