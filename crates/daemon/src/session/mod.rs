//! Child supervision: the pty process and the reader fan-out.

pub mod multiplexer;
pub mod pty;

pub use multiplexer::{ReaderChannel, ReaderFanout, ReaderStats};
pub use pty::{
    make_raw, make_standard, strip_carriage_returns, suffixed_command, Launch, PtyProcess,
    PtyRead, READ_CHUNK_SIZE,
};
