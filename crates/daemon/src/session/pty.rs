//! Child process on a pseudo-terminal.
//!
//! This module starts the command under `<shell> -c`, exposes the pty
//! master for polling, reading and writing, and applies terminal modes.

use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::termios::{
    tcgetattr, tcsetattr, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios,
};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{SessionId, TerminalMode};

use crate::error::DaemonError;

/// Commands longer than this are written to a script instead of passed to `-c`.
pub const SCRIPT_THRESHOLD: usize = 255;

/// Scripts longer than this raise the stack and open-file limits first.
pub const RAISED_LIMITS_THRESHOLD: usize = 2_000_000;

/// Maximum bytes taken from the pty per wake.
pub const READ_CHUNK_SIZE: usize = 4096;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Append the trailer that lets the session id be found in the process
/// table.
pub fn suffixed_command(command: &str, id: &SessionId) -> String {
    format!("{command} && echo {id} > /dev/null")
}

/// Stack limit in KiB for a script of `len` bytes.
pub fn stack_limit_kib(len: usize) -> usize {
    (1 + len / 2_072_576) * 8196
}

/// Single-quote `word` for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// How the shell receives the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// `<shell> -c <command>`
    Inline(String),
    /// `<shell> -c ". '<path>'"` after writing `contents` to `path`.
    Script { path: PathBuf, contents: String },
}

impl Launch {
    /// Choose how to pass `command`, using `script_path` when it is too long.
    pub fn plan(command: &str, script_path: &Path) -> Self {
        if command.len() <= SCRIPT_THRESHOLD {
            return Launch::Inline(command.to_string());
        }
        let contents = if command.len() > RAISED_LIMITS_THRESHOLD {
            format!(
                "ulimit -s {}\nulimit -n 819200\n{command}",
                stack_limit_kib(command.len())
            )
        } else {
            command.to_string()
        };
        Launch::Script {
            path: script_path.to_path_buf(),
            contents,
        }
    }

    /// Argument passed after `-c`.
    pub fn shell_argument(&self) -> String {
        match self {
            Launch::Inline(command) => command.clone(),
            Launch::Script { path, .. } => {
                format!(". {}", shell_quote(&path.to_string_lossy()))
            }
        }
    }

    /// Write the script, if any.
    pub fn prepare(&self) -> Result<(), DaemonError> {
        if let Launch::Script { path, contents } = self {
            fs::write(path, contents).map_err(|e| DaemonError::channel(path, e))?;
        }
        Ok(())
    }
}

/// Outcome of one read from the pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyRead {
    Data(usize),
    /// The slave side is gone; no more output will arrive.
    Closed,
}

/// The supervised child and its pty master.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    master_fd: RawFd,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn `shell -c <launch>` on a new pty.
    pub fn spawn(shell: &Path, launch: &Launch, cwd: &Path) -> Result<Self, DaemonError> {
        launch.prepare()?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DaemonError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-c");
        cmd.arg(launch.shell_argument());
        cmd.cwd(cwd);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DaemonError::SpawnFailed(e.to_string()))?;
        // the child owns the slave now
        drop(pair.slave);

        let pid = child.process_id();
        let master_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| DaemonError::SpawnFailed("pty master has no file descriptor".into()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DaemonError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DaemonError::SpawnFailed(e.to_string()))?;

        tracing::info!(pid = ?pid, shell = %shell.display(), "Child spawned");

        Ok(Self {
            master: pair.master,
            reader,
            writer,
            child,
            master_fd,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Borrow the master for polling.
    pub fn master_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the fd belongs to `self.master`, which outlives the borrow.
        unsafe { BorrowedFd::borrow_raw(self.master_fd) }
    }

    /// Read one chunk of output.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<PtyRead> {
        loop {
            match self.reader.read(buf) {
                Ok(0) => return Ok(PtyRead::Closed),
                Ok(n) => return Ok(PtyRead::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports a hung-up slave as EIO
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => return Ok(PtyRead::Closed),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write bytes to the child's terminal.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    /// Non-blocking check for termination; returns the exit status once the
    /// child has been reaped.
    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.exit_code() as i32))
    }

    /// Apply a terminal mode to the pty.
    pub fn set_mode(&self, mode: TerminalMode, echo: bool) -> Result<(), DaemonError> {
        let fd = self.master_fd();
        let mut termios = tcgetattr(fd)?;
        match mode {
            TerminalMode::Raw => make_raw(&mut termios),
            TerminalMode::Standard => make_standard(&mut termios, echo),
        }
        tcsetattr(fd, SetArg::TCSANOW, &termios)?;
        tracing::debug!(mode = %mode, echo, "Terminal mode applied");
        Ok(())
    }

    /// Size of the terminal, for diagnostics.
    pub fn size(&self) -> Option<(u16, u16)> {
        self.master.get_size().ok().map(|s| (s.cols, s.rows))
    }
}

/// Byte-transparent mode: no input translation, no output processing,
/// 8-bit characters, no echo, no canonical mode and no signal keys.
pub fn make_raw(termios: &mut Termios) {
    termios.input_flags &= !(InputFlags::IGNBRK
        | InputFlags::BRKINT
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON);
    termios.output_flags &= !OutputFlags::OPOST;
    termios.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
    termios.control_flags |= ControlFlags::CS8;
    termios.local_flags &= !(LocalFlags::ECHO
        | LocalFlags::ECHONL
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN);
}

/// Line mode without CR/NL translation; echo as requested.
pub fn make_standard(termios: &mut Termios, echo: bool) {
    termios.input_flags &= !(InputFlags::INLCR | InputFlags::ICRNL | InputFlags::IGNCR);
    termios.output_flags &= !OutputFlags::OPOST;
    termios.local_flags.set(LocalFlags::ECHO, echo);
}

/// Remove carriage returns from child output.
pub fn strip_carriage_returns(data: &[u8]) -> Vec<u8> {
    data.iter().copied().filter(|&b| b != b'\r').collect()
}
