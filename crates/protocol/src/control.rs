//! Length-prefixed control frames carried on the control fifo.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 10 bytes: payload length, decimal, right-aligned and space padded
//! - N bytes: payload, an ASCII keyword naming a terminal mode
//!
//! Unknown keywords are rejected by [`TerminalMode::from_keyword`]; the
//! framing itself is keyword agnostic.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Width of the decimal length prefix.
pub const LENGTH_PREFIX_WIDTH: usize = 10;

/// Maximum control payload size.
pub const MAX_CONTROL_PAYLOAD: usize = 4096;

/// Terminal mode of the child's pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// Byte transparent: no echo, no line discipline, no signal keys.
    Raw,
    /// Canonical line discipline with CR/NL translation disabled.
    Standard,
}

impl TerminalMode {
    /// Keyword used on the wire.
    pub fn keyword(self) -> &'static str {
        match self {
            TerminalMode::Raw => "raw",
            TerminalMode::Standard => "standard",
        }
    }

    pub fn from_keyword(keyword: &str) -> Result<Self> {
        match keyword {
            "raw" => Ok(TerminalMode::Raw),
            "standard" => Ok(TerminalMode::Standard),
            other => Err(ProtocolError::UnknownMode(other.to_string())),
        }
    }

    /// Encode a request for this mode as a control frame.
    pub fn to_frame(self) -> Vec<u8> {
        let keyword = self.keyword();
        format!("{:>width$}{keyword}", keyword.len(), width = LENGTH_PREFIX_WIDTH).into_bytes()
    }
}

impl fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for TerminalMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_keyword(s)
    }
}

/// Encoder and decoder for control frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a payload into a frame.
    pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_CONTROL_PAYLOAD,
            });
        }
        let mut output = Vec::with_capacity(LENGTH_PREFIX_WIDTH + payload.len());
        let prefix = format!("{:>width$}", payload.len(), width = LENGTH_PREFIX_WIDTH);
        output.extend_from_slice(prefix.as_bytes());
        output.extend_from_slice(payload);
        Ok(output)
    }

    /// Try to decode one frame from the front of a buffer.
    ///
    /// Returns `Ok(None)` if more data is needed, otherwise the payload and
    /// the number of bytes consumed.
    pub fn try_decode(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < LENGTH_PREFIX_WIDTH {
            return Ok(None);
        }

        let prefix = &data[..LENGTH_PREFIX_WIDTH];
        let text = std::str::from_utf8(prefix).map_err(|_| {
            ProtocolError::InvalidLengthPrefix(String::from_utf8_lossy(prefix).into_owned())
        })?;
        let len: usize = text
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidLengthPrefix(text.to_string()))?;

        if len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_CONTROL_PAYLOAD,
            });
        }

        let total = LENGTH_PREFIX_WIDTH + len;
        if data.len() < total {
            return Ok(None);
        }

        Ok(Some((data[LENGTH_PREFIX_WIDTH..total].to_vec(), total)))
    }
}
