//! On-disk layout of a session directory.
//!
//! Every session owns one directory `<base>/aexpect_<id>` holding the pid and
//! status files, the output log, the input/control/reader fifos and the two
//! lock files. Both the helper and every controller derive paths from
//! [`SessionLayout`] so the names never drift apart.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::lock::LockKind;

/// Prefix of every session directory name.
pub const SESSION_DIR_PREFIX: &str = "aexpect_";

/// Number of characters in a generated session id.
pub const SESSION_ID_LENGTH: usize = 8;

/// File holding the decimal pid of the supervised child.
pub const PID_FILE: &str = "shell-pid";
/// File holding the decimal exit status once the child has terminated.
pub const STATUS_FILE: &str = "status";
/// Append-only log of everything the child printed, CRs removed.
pub const OUTPUT_FILE: &str = "output";
/// Fifo carrying bytes to the child's terminal.
pub const INPUT_PIPE: &str = "inpipe";
/// Fifo carrying length-prefixed terminal mode requests.
pub const CONTROL_PIPE: &str = "ctrlpipe";
/// Diagnostic log written by the helper.
pub const SERVER_LOG: &str = "server-log";
/// Script used when the command is too long for a `-c` argument.
pub const COMMAND_SCRIPT: &str = "command.sh";
/// Prefix of each named reader fifo.
pub const READER_PIPE_PREFIX: &str = "outpipe-";

/// Identifier of a session, unique per base directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..SESSION_ID_LENGTH].to_string())
    }

    /// Validate an identifier received from a caller or over the handshake.
    pub fn parse(id: &str) -> Result<Self> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(ProtocolError::InvalidSessionId(id.to_string()))
        }
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check that a reader name can be used inside a file name and a
/// comma-separated handshake field.
pub fn validate_reader_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains([',', '/', '\n', '\0']) {
        return Err(ProtocolError::InvalidReaderName(name.to_string()));
    }
    Ok(())
}

/// Paths of every file belonging to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    id: SessionId,
    dir: PathBuf,
}

impl SessionLayout {
    /// Layout for session `id` under `base_dir`.
    pub fn new(base_dir: &Path, id: &SessionId) -> Self {
        Self {
            id: id.clone(),
            dir: base_dir.join(format!("{SESSION_DIR_PREFIX}{id}")),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    pub fn status_file(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn output_file(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub fn input_pipe(&self) -> PathBuf {
        self.dir.join(INPUT_PIPE)
    }

    pub fn control_pipe(&self) -> PathBuf {
        self.dir.join(CONTROL_PIPE)
    }

    pub fn server_log(&self) -> PathBuf {
        self.dir.join(SERVER_LOG)
    }

    pub fn command_script(&self) -> PathBuf {
        self.dir.join(COMMAND_SCRIPT)
    }

    /// Fifo for the named reader.
    pub fn reader_pipe(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{READER_PIPE_PREFIX}{name}"))
    }

    /// Lock file backing the given lock.
    pub fn lock_file(&self, kind: LockKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Read the child pid, if the helper has recorded it.
    pub fn read_pid(&self) -> Option<u32> {
        read_number(&self.pid_file())
    }

    /// Read the exit status, if the child has terminated.
    pub fn read_status(&self) -> Option<i32> {
        read_number(&self.status_file())
    }
}

/// Parse a file holding a single decimal number. Missing or malformed files
/// yield `None`.
fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}
