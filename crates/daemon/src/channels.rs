//! Files and fifos of a running session.
//!
//! The helper opens every fifo read-write and non-blocking, so opening
//! never waits for a peer and controllers may come and go at any time.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use protocol::SessionLayout;

use crate::error::DaemonError;
use crate::session::{ReaderChannel, ReaderFanout};

/// Append-only log of the child's output.
#[derive(Debug)]
pub struct OutputLog {
    file: File,
    len: u64,
}

impl OutputLog {
    fn create(path: &Path) -> Result<Self, DaemonError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DaemonError::channel(path, e))?;
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { file, len })
    }

    /// Append a chunk and flush it, so controllers see it immediately.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.file.flush()?;
        self.len += data.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Every channel the helper serves.
#[derive(Debug)]
pub struct ChannelSet {
    layout: SessionLayout,
    input: Option<File>,
    control: Option<File>,
    readers: ReaderFanout,
    log: OutputLog,
}

impl ChannelSet {
    /// Create the session directory and its channels.
    ///
    /// Passive sessions get no input or control fifo.
    pub fn create(
        layout: &SessionLayout,
        reader_names: &[String],
        passive: bool,
    ) -> Result<Self, DaemonError> {
        fs::create_dir_all(layout.dir()).map_err(|e| DaemonError::channel(layout.dir(), e))?;

        let (input, control) = if passive {
            (None, None)
        } else {
            (
                Some(open_fifo(&layout.input_pipe())?),
                Some(open_fifo(&layout.control_pipe())?),
            )
        };

        let mut readers = ReaderFanout::new();
        for name in reader_names {
            let file = open_fifo(&layout.reader_pipe(name))?;
            readers.push(ReaderChannel::new(name.clone(), file));
        }

        let log = OutputLog::create(&layout.output_file())?;

        tracing::debug!(
            dir = %layout.dir().display(),
            readers = reader_names.len(),
            passive,
            "Session channels created"
        );

        Ok(Self {
            layout: layout.clone(),
            input,
            control,
            readers,
            log,
        })
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn input(&self) -> Option<&File> {
        self.input.as_ref()
    }

    pub fn control(&self) -> Option<&File> {
        self.control.as_ref()
    }

    pub fn readers(&self) -> &ReaderFanout {
        &self.readers
    }

    pub fn readers_mut(&mut self) -> &mut ReaderFanout {
        &mut self.readers
    }

    pub fn log_mut(&mut self) -> &mut OutputLog {
        &mut self.log
    }

    /// Read everything currently buffered on the input fifo.
    pub fn read_input(&mut self) -> io::Result<Vec<u8>> {
        match self.input.as_mut() {
            Some(file) => read_available(file),
            None => Ok(Vec::new()),
        }
    }

    /// Read everything currently buffered on the control fifo.
    pub fn read_control(&mut self) -> io::Result<Vec<u8>> {
        match self.control.as_mut() {
            Some(file) => read_available(file),
            None => Ok(Vec::new()),
        }
    }

    pub fn write_pid(&self, pid: u32) -> Result<(), DaemonError> {
        let path = self.layout.pid_file();
        fs::write(&path, pid.to_string()).map_err(|e| DaemonError::channel(path, e))
    }

    pub fn write_status(&self, status: i32) -> Result<(), DaemonError> {
        let path = self.layout.status_file();
        fs::write(&path, status.to_string()).map_err(|e| DaemonError::channel(path, e))
    }

    /// Close the input, control and log, keeping only the readers.
    ///
    /// The readers come back detached: each consumer sees end-of-stream
    /// once its queue is written and the fan-out is dropped.
    pub fn release_readers(self) -> ReaderFanout {
        tracing::debug!(dir = %self.layout.dir().display(), "Closing session channels");
        let ChannelSet {
            layout,
            mut readers,
            ..
        } = self;
        readers.detach_all(|name| layout.reader_pipe(name));
        readers
    }
}

/// Create a fifo if needed and open it read-write, non-blocking.
fn open_fifo(path: &Path) -> Result<File, DaemonError> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(DaemonError::channel(path, e.into())),
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(|e| DaemonError::channel(path, e))
}

/// Read until the descriptor would block.
fn read_available(file: &mut File) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(data)
}
