//! Fan-out of child output to named reader fifos.
//!
//! Every chunk the child prints is queued on each reader. Queues are flushed
//! with non-blocking writes whenever the fifo has room, so a slow consumer
//! delays only its own stream and never loses bytes. A queue is dropped
//! only once its consumer has closed the fifo.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use nix::fcntl::OFlag;

/// Statistics about a reader's stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Total bytes written into the fifo.
    pub bytes_written: u64,
    /// Bytes queued but not yet written.
    pub bytes_pending: usize,
    /// Whether the last flush stopped on a full fifo.
    pub is_backpressured: bool,
    /// Whether the consumer closed the fifo.
    pub is_consumer_gone: bool,
}

/// One named reader fifo and its pending queue.
#[derive(Debug)]
pub struct ReaderChannel {
    name: String,
    file: File,
    pending: BytesMut,
    bytes_written: u64,
    backpressured: bool,
    consumer_gone: bool,
}

impl ReaderChannel {
    /// Wrap a fifo already opened for non-blocking writes.
    pub fn new(name: impl Into<String>, file: File) -> Self {
        Self {
            name: name.into(),
            file,
            pending: BytesMut::new(),
            bytes_written: 0,
            backpressured: false,
            consumer_gone: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            bytes_written: self.bytes_written,
            bytes_pending: self.pending.len(),
            is_backpressured: self.backpressured,
            is_consumer_gone: self.consumer_gone,
        }
    }

    pub fn is_consumer_gone(&self) -> bool {
        self.consumer_gone
    }

    /// Queue a chunk behind everything already pending.
    pub fn enqueue(&mut self, data: &[u8]) {
        if !self.consumer_gone {
            self.pending.extend_from_slice(data);
        }
    }

    /// Stop queueing for this reader and drop what is pending.
    pub fn abandon(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(
                reader = %self.name,
                dropped = self.pending.len(),
                "Dropping output queued for a departed reader"
            );
        }
        self.consumer_gone = true;
        self.backpressured = false;
        self.pending.clear();
    }

    /// Replace the read-write descriptor with a write-only one.
    ///
    /// While the helper holds the fifo open for reading, a consumer that
    /// goes away is never noticed. Once detached, writes fail with EPIPE
    /// when no consumer is left, and consumers see end-of-stream as soon as
    /// the channel is dropped.
    pub fn detach(&mut self, path: &Path) {
        let reopened = OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path);
        match reopened {
            Ok(file) => self.file = file,
            Err(e) => {
                tracing::warn!(reader = %self.name, error = %e, "Failed to reopen reader for shutdown");
                self.abandon();
            }
        }
    }

    /// Write as much of the queue as the fifo accepts without blocking.
    ///
    /// Returns the number of bytes written.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while !self.pending.is_empty() {
            match self.file.write(&self.pending) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    self.abandon();
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.backpressured {
                        self.backpressured = true;
                        tracing::debug!(
                            reader = %self.name,
                            pending = self.pending.len(),
                            "Reader is backpressured, queueing output"
                        );
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.bytes_written += written as u64;
        if self.pending.is_empty() && self.backpressured {
            self.backpressured = false;
            tracing::debug!(reader = %self.name, "Reader recovered from backpressure");
        }
        Ok(written)
    }
}

impl AsFd for ReaderChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// All reader fifos of a session.
#[derive(Debug, Default)]
pub struct ReaderFanout {
    readers: Vec<ReaderChannel>,
}

impl ReaderFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reader: ReaderChannel) {
        self.readers.push(reader);
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ReaderChannel> {
        self.readers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReaderChannel> {
        self.readers.iter()
    }

    /// Queue a chunk on every reader.
    pub fn broadcast(&mut self, data: &[u8]) {
        for reader in &mut self.readers {
            reader.enqueue(data);
        }
    }

    /// Indices of readers with queued data.
    pub fn pending(&self) -> Vec<usize> {
        self.readers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_pending())
            .map(|(i, _)| i)
            .collect()
    }

    /// Flush the reader at `index`. A reader whose fifo fails with
    /// anything but a full buffer is abandoned.
    pub fn flush(&mut self, index: usize) -> usize {
        let Some(reader) = self.readers.get_mut(index) else {
            return 0;
        };
        match reader.flush() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(reader = %reader.name(), error = %e, "Failed to write to reader");
                reader.abandon();
                0
            }
        }
    }

    /// Detach every reader, resolving each fifo path by reader name.
    pub fn detach_all(&mut self, path_of: impl Fn(&str) -> PathBuf) {
        for reader in &mut self.readers {
            let path = path_of(reader.name());
            reader.detach(&path);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.readers.iter().any(ReaderChannel::has_pending)
    }
}
