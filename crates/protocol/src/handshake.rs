//! Startup handshake between a controller and a freshly launched helper.
//!
//! # Format
//!
//! The controller writes four newline-terminated fields to the helper's
//! standard input and then closes it:
//!
//! ```text
//! <session id>\n
//! True|False\n          echo flag
//! <reader,reader,...>\n possibly empty
//! <command>\n           may itself contain newlines
//! ```
//!
//! Once its channels exist and the child is running, the helper prints
//! `Server <id> ready` on standard output.

use std::io::{BufRead, Read};

use crate::error::{ProtocolError, Result};
use crate::layout::{validate_reader_name, SessionId};

/// Parameters a helper needs to start a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub id: SessionId,
    /// Whether the terminal echoes input back into the output.
    pub echo: bool,
    /// Names of the fifo readers to create.
    pub readers: Vec<String>,
    /// Shell command line to supervise.
    pub command: String,
}

impl Handshake {
    pub fn new(id: SessionId, echo: bool, readers: Vec<String>, command: impl Into<String>) -> Self {
        Self {
            id,
            echo,
            readers,
            command: command.into(),
        }
    }

    /// Serialize the handshake as written to the helper's standard input.
    pub fn encode(&self) -> Vec<u8> {
        let echo = if self.echo { "True" } else { "False" };
        format!(
            "{}\n{}\n{}\n{}\n",
            self.id,
            echo,
            self.readers.join(","),
            self.command
        )
        .into_bytes()
    }

    /// Read a handshake from a stream. Everything after the reader line is
    /// the command, minus the terminating newline.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let id = read_field(reader, "session id")?;
        let id = SessionId::parse(&id)?;
        let echo = read_field(reader, "echo flag")? == "True";
        let readers_line = read_field(reader, "reader list")?;
        let readers = readers_line
            .split(',')
            .filter(|name| !name.is_empty())
            .map(|name| validate_reader_name(name).map(|()| name.to_string()))
            .collect::<Result<Vec<_>>>()?;

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest)?;
        let mut command =
            String::from_utf8(rest).map_err(|e| ProtocolError::HandshakeEncoding(e.to_string()))?;
        if command.ends_with('\n') {
            command.pop();
        }

        Ok(Self {
            id,
            echo,
            readers,
            command,
        })
    }
}

fn read_field<R: BufRead>(reader: &mut R, field: &'static str) -> Result<String> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 || buf.last() != Some(&b'\n') {
        return Err(ProtocolError::HandshakeTruncated(field));
    }
    buf.pop();
    String::from_utf8(buf).map_err(|e| ProtocolError::HandshakeEncoding(e.to_string()))
}

/// Line the helper prints once the session is usable.
pub fn readiness_line(id: &SessionId) -> String {
    format!("Server {id} ready")
}

/// Whether a line of helper output announces readiness of session `id`.
pub fn is_readiness_line(line: &str, id: &SessionId) -> bool {
    line.contains(&readiness_line(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn id() -> SessionId {
        SessionId::parse("a1b2c3d4").unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let hs = Handshake::new(id(), true, vec!["tail".into(), "log".into()], "ls -l");
        assert_eq!(hs.encode(), b"a1b2c3d4\nTrue\ntail,log\nls -l\n".to_vec());
    }

    #[test]
    fn test_decode_multiline_command() {
        let raw = b"a1b2c3d4\nFalse\n\nfor i in 1 2; do\n  echo $i\ndone\n";
        let hs = Handshake::read_from(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(hs.id, id());
        assert!(!hs.echo);
        assert!(hs.readers.is_empty());
        assert_eq!(hs.command, "for i in 1 2; do\n  echo $i\ndone");
    }

    #[test]
    fn test_decode_encoded_handshake() {
        let hs = Handshake::new(id(), false, vec!["x".into()], "sleep 1");
        let decoded = Handshake::read_from(&mut Cursor::new(hs.encode())).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_decode_truncated() {
        let err = Handshake::read_from(&mut Cursor::new(&b"a1b2c3d4\nTrue"[..])).unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeTruncated("echo flag")));
    }

    #[test]
    fn test_decode_rejects_bad_reader() {
        let raw = b"a1b2c3d4\nTrue\nok,../x\ncmd\n";
        let err = Handshake::read_from(&mut Cursor::new(&raw[..])).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidReaderName(_)));
    }

    #[test]
    fn test_readiness_line() {
        assert_eq!(readiness_line(&id()), "Server a1b2c3d4 ready");
        assert!(is_readiness_line("noise Server a1b2c3d4 ready", &id()));
        assert!(!is_readiness_line("Server zzzz ready", &id()));
    }
}
