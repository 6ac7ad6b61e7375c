//! Turning the child's bytes into text.
//!
//! Output is decoded with the session's configured encoding. Reads decode
//! incrementally, so a character split across two reads is held back until
//! the rest arrives, and malformed bytes become U+FFFD right away.

use std::fmt;
use std::sync::LazyLock;

use encoding_rs::{CoderResult, Decoder, Encoding};
use regex::Regex;

use crate::error::{ExpectError, Result};

/// Escape sequences of the Linux console that [`strip_console_codes`]
/// removes.
const CONSOLE_CODES: &str = concat!(
    r"%[G@8]|\[[@A-HJ-MPXa-hl-nqrsu`]",
    r"|\[[\d;]+[HJKgqnrm]|#8|\([B0UK]|\)|\[\?2004[lh]",
);

static CONSOLE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("\x1b(?:{CONSOLE_CODES})")).unwrap());

/// Streaming decoder for one output stream.
pub struct TextDecoder {
    encoding: &'static Encoding,
    decoder: Decoder,
}

impl TextDecoder {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            decoder: encoding.new_decoder_without_bom_handling(),
        }
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Decode the next chunk. A trailing partial character stays buffered.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.run(bytes, false)
    }

    /// Decode the final chunk of the stream. Anything still buffered is
    /// flushed, a partial character as U+FFFD. The decoder starts over
    /// afterwards.
    pub fn finish(&mut self, bytes: &[u8]) -> String {
        let text = self.run(bytes, true);
        self.decoder = self.encoding.new_decoder_without_bom_handling();
        text
    }

    fn run(&mut self, mut src: &[u8], last: bool) -> String {
        let mut out = String::new();
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len() * 3 + 16);
            out.reserve(needed);
            let (result, read, _) = self.decoder.decode_to_string(src, &mut out, last);
            src = &src[read..];
            match result {
                CoderResult::InputEmpty => return out,
                CoderResult::OutputFull => continue,
            }
        }
    }
}

impl fmt::Debug for TextDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextDecoder")
            .field("encoding", &self.encoding.name())
            .finish_non_exhaustive()
    }
}

/// Decode a complete buffer.
pub fn decode_all(encoding: &'static Encoding, bytes: &[u8]) -> String {
    encoding.decode_without_bom_handling(bytes).0.into_owned()
}

/// Encode text for the child. Characters the encoding cannot represent
/// become numeric character references.
pub fn encode(encoding: &'static Encoding, text: &str) -> Vec<u8> {
    encoding.encode(text).0.into_owned()
}

/// Remove Linux console escape sequences from `text`.
///
/// Unknown sequences are left in place.
pub fn strip_console_codes(text: &str) -> String {
    if !text.contains('\x1b') {
        return text.to_string();
    }
    CONSOLE_CODE_RE.replace_all(text, "").into_owned()
}

/// Like [`strip_console_codes`], also removing sequences matching
/// `custom`, given without the leading escape character.
pub fn strip_console_codes_with(text: &str, custom: &str) -> Result<String> {
    let re = Regex::new(&format!("\x1b(?:{CONSOLE_CODES}|{custom})")).map_err(|e| {
        ExpectError::InvalidPattern {
            pattern: custom.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(re.replace_all(text, "").into_owned())
}
