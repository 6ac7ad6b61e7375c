//! The helper's event loop.
//!
//! One [`Server`] supervises one child. Each loop wake waits up to the wake
//! interval for any channel to become ready, then handles the ready
//! channels in a fixed order:
//!
//! 1. flush reader fifos that have room
//! 2. apply queued control frames
//! 3. move one chunk of child output into the log and reader queues
//! 4. check for child termination, if the pty was closed or idle
//! 5. forward controller input to the child
//!
//! Termination ends the loop before step 5. Shutdown then writes the exit
//! status, waits for any starting controller, closes the channels and frees
//! the server-running lock. Reader queues are drained last, for as long as
//! their consumers stay.

use std::os::fd::AsFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use protocol::{ControlCodec, Handshake, LockKind, SessionId, SessionLayout, SessionLocks, TerminalMode};

use crate::channels::ChannelSet;
use crate::config::ServerOptions;
use crate::error::DaemonError;
use crate::session::{
    strip_carriage_returns, suffixed_command, Launch, PtyProcess, PtyRead, ReaderFanout,
    READ_CHUNK_SIZE,
};

/// Which channels a poll reported ready.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Readiness {
    pty: bool,
    input: bool,
    control: bool,
    /// Indices of reader fifos with queued data and room to write.
    writable: Vec<usize>,
}

/// Steps of one loop wake.
#[derive(Debug)]
enum Phase {
    Poll,
    Dispatch(Readiness),
    CheckTermination { check: bool, input_ready: bool },
    ForwardInput,
}

/// Supervisor of one child process.
pub struct Server<L: SessionLocks> {
    id: SessionId,
    echo: bool,
    pty: PtyProcess,
    pty_open: bool,
    channels: ChannelSet,
    locks: L,
    server_lock: Option<L::Handle>,
    options: ServerOptions,
    control_buf: Vec<u8>,
}

impl<L: SessionLocks> Server<L> {
    /// Create the session channels, take the server-running lock and start
    /// the child. On success the session is ready to be announced.
    pub fn start(
        handshake: &Handshake,
        options: &ServerOptions,
        locks: L,
    ) -> Result<Self, DaemonError> {
        let layout = SessionLayout::new(&options.base_dir, &handshake.id);
        let channels = ChannelSet::create(&layout, &handshake.readers, options.passive)?;
        let server_lock = locks.acquire(LockKind::ServerRunning)?;

        let command = suffixed_command(&handshake.command, &handshake.id);
        let launch = Launch::plan(&command, &layout.command_script());
        let cwd = std::env::current_dir().unwrap_or_else(|_| Path::new("/").to_path_buf());
        let pty = PtyProcess::spawn(&options.shell, &launch, &cwd)?;
        pty.set_mode(TerminalMode::Standard, handshake.echo)?;

        if let Some(pid) = pty.pid() {
            channels.write_pid(pid)?;
        }

        tracing::info!(
            session_id = %handshake.id,
            pid = ?pty.pid(),
            size = ?pty.size(),
            readers = ?handshake.readers,
            "Session started"
        );

        Ok(Self {
            id: handshake.id.clone(),
            echo: handshake.echo,
            pty,
            pty_open: true,
            channels,
            locks,
            server_lock: Some(server_lock),
            options: options.clone(),
            control_buf: Vec::new(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// Serve the session until the child terminates, then shut down.
    /// Returns the child's exit status.
    pub fn run(mut self) -> Result<i32, DaemonError> {
        let status = loop {
            if let Some(status) = self.wake()? {
                break status;
            }
        };
        self.drain_pty();
        tracing::info!(session_id = %self.id, status, "Child terminated");

        let Server {
            channels,
            locks,
            server_lock,
            options,
            ..
        } = self;
        finish_session(&locks, server_lock, channels, status, options.wake_interval)?;
        Ok(status)
    }

    /// One loop wake. Returns the exit status once the child is gone.
    fn wake(&mut self) -> Result<Option<i32>, DaemonError> {
        let mut phase = Phase::Poll;
        loop {
            phase = match phase {
                Phase::Poll => Phase::Dispatch(self.poll_channels()?),
                Phase::Dispatch(ready) => {
                    for index in &ready.writable {
                        self.channels.readers_mut().flush(*index);
                    }
                    if ready.control {
                        self.apply_control();
                    }
                    let pty_closed = ready.pty && self.pump_pty();
                    Phase::CheckTermination {
                        check: pty_closed || !ready.pty,
                        input_ready: ready.input,
                    }
                }
                Phase::CheckTermination { check, input_ready } => {
                    if check {
                        if let Some(status) = self.try_wait() {
                            return Ok(Some(status));
                        }
                    }
                    if !input_ready {
                        return Ok(None);
                    }
                    Phase::ForwardInput
                }
                Phase::ForwardInput => {
                    self.forward_input();
                    return Ok(None);
                }
            };
        }
    }

    fn poll_timeout(&self) -> PollTimeout {
        poll_timeout(self.options.wake_interval)
    }

    fn poll_channels(&self) -> Result<Readiness, DaemonError> {
        let pending = self.channels.readers().pending();
        let mut fds = Vec::with_capacity(3 + pending.len());

        let pty_slot = self.pty_open.then(|| {
            fds.push(PollFd::new(self.pty.master_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });
        let input_slot = self.channels.input().map(|file| {
            fds.push(PollFd::new(file.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });
        let control_slot = self.channels.control().map(|file| {
            fds.push(PollFd::new(file.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });
        let first_reader = fds.len();
        for &index in &pending {
            if let Some(reader) = self.channels.readers().get(index) {
                fds.push(PollFd::new(reader.as_fd(), PollFlags::POLLOUT));
            }
        }

        match poll(&mut fds, self.poll_timeout()) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Readiness::default()),
            Err(e) => return Err(DaemonError::Io(e.into())),
        }

        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let is_set = |slot: Option<usize>, flags: PollFlags| {
            slot.and_then(|i| fds[i].revents())
                .is_some_and(|revents| revents.intersects(flags))
        };

        Ok(Readiness {
            pty: is_set(pty_slot, readable),
            input: is_set(input_slot, readable),
            control: is_set(control_slot, readable),
            writable: pending
                .iter()
                .enumerate()
                .filter(|(slot, _)| is_set(Some(first_reader + slot), PollFlags::POLLOUT))
                .map(|(_, &index)| index)
                .collect(),
        })
    }

    fn apply_control(&mut self) {
        match self.channels.read_control() {
            Ok(data) => self.control_buf.extend_from_slice(&data),
            Err(e) => tracing::warn!(error = %e, "Failed to read control channel"),
        }

        loop {
            match ControlCodec::try_decode(&self.control_buf) {
                Ok(Some((payload, used))) => {
                    self.control_buf.drain(..used);
                    let keyword = String::from_utf8_lossy(&payload);
                    match TerminalMode::from_keyword(&keyword) {
                        Ok(mode) => {
                            if let Err(e) = self.pty.set_mode(mode, self.echo) {
                                tracing::warn!(mode = %mode, error = %e, "Failed to apply terminal mode");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring control request"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding malformed control data");
                    self.control_buf.clear();
                    break;
                }
            }
        }
    }

    /// Move one chunk of child output to the log and readers. Returns true
    /// once the pty is closed.
    fn pump_pty(&mut self) -> bool {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        match self.pty.read_chunk(&mut buf) {
            Ok(PtyRead::Data(n)) => {
                let data = strip_carriage_returns(&buf[..n]);
                if let Err(e) = self.channels.log_mut().append(&data) {
                    tracing::warn!(error = %e, "Failed to append to output log");
                }
                self.channels.readers_mut().broadcast(&data);
                false
            }
            Ok(PtyRead::Closed) => {
                tracing::debug!(session_id = %self.id, "PTY closed");
                self.pty_open = false;
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Error reading from PTY");
                self.pty_open = false;
                true
            }
        }
    }

    /// Pull whatever output is still buffered in the pty.
    fn drain_pty(&mut self) {
        while self.pty_open {
            let mut fds = [PollFd::new(self.pty.master_fd(), PollFlags::POLLIN)];
            let ready = matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0);
            if !ready || self.pump_pty() {
                break;
            }
        }
    }

    fn try_wait(&mut self) -> Option<i32> {
        match self.pty.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(error = %e, "Wait for child failed, retrying next wake");
                None
            }
        }
    }

    fn forward_input(&mut self) {
        let data = match self.channels.read_input() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read input channel");
                return;
            }
        };
        if data.is_empty() {
            return;
        }
        if let Err(e) = self.pty.write_all(&data) {
            tracing::warn!(error = %e, bytes = data.len(), "Failed to write to PTY");
        }
    }
}

/// Final steps once the child has terminated.
///
/// The status is written first, so it is visible by the time the
/// server-running lock is free. Channels stay open while a controller holds
/// the client-starting lock. The log is complete before the lock is
/// released, so readers are drained afterwards until every queue is written
/// or its consumer has gone.
pub fn finish_session<L: SessionLocks>(
    locks: &L,
    server_lock: Option<L::Handle>,
    mut channels: ChannelSet,
    status: i32,
    poll_interval: Duration,
) -> Result<(), DaemonError> {
    channels.write_status(status)?;
    locks.wait_until_free(LockKind::ClientStarting)?;
    let mut readers = channels.release_readers();
    if let Some(handle) = server_lock {
        locks.release(handle)?;
    }
    tracing::info!(status, "Session finished");
    drain_readers(&mut readers, poll_interval);
    Ok(())
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    PollTimeout::from(u16::try_from(interval.as_millis()).unwrap_or(u16::MAX))
}

/// Keep flushing queued reader data until no reader has any left.
fn drain_readers(readers: &mut ReaderFanout, poll_interval: Duration) {
    let ready = PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP;
    loop {
        let pending = readers.pending();
        if pending.is_empty() {
            break;
        }
        let writable: Vec<usize> = {
            let mut fds: Vec<PollFd<'_>> = pending
                .iter()
                .filter_map(|&i| readers.get(i))
                .map(|reader| PollFd::new(reader.as_fd(), PollFlags::POLLOUT))
                .collect();
            match poll(&mut fds, poll_timeout(poll_interval)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Polling readers failed, dropping their output");
                    return;
                }
            }
            pending
                .iter()
                .zip(fds.iter())
                .filter(|(_, fd)| fd.revents().is_some_and(|r| r.intersects(ready)))
                .map(|(&i, _)| i)
                .collect()
        };
        for index in writable {
            readers.flush(index);
        }
    }
    tracing::debug!(
        delivered = readers.iter().filter(|r| !r.is_consumer_gone()).count(),
        "Reader output drained"
    );
}
