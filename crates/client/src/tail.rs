//! Background listeners on reader fifos.
//!
//! A [`TailListener`] owns one reader fifo and hands what arrives to a
//! callback. When the helper closes the fifo the listener reads the exit
//! status and, if one was recorded, invokes the termination callback once.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use encoding_rs::Encoding;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use protocol::SessionLayout;

use crate::text::TextDecoder;

/// Bytes requested from the fifo per read.
const TAIL_READ_SIZE: usize = 4096;

/// Quiet time after which a line tail delivers an unterminated line.
pub const LINE_IDLE_FLUSH: Duration = Duration::from_millis(50);

/// Open a reader fifo for reading without blocking on a writer.
pub fn open_reader(layout: &SessionLayout, name: &str) -> io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().open_receiver(layout.reader_pipe(name))
}

/// How a line tail formats and records its lines.
#[derive(Debug, Clone)]
pub struct LineTailOptions {
    /// Prepended to every line.
    pub prefix: String,
    /// Every delivered line is also appended to this file.
    pub log_file: Option<PathBuf>,
    /// Encoding of the stream.
    pub encoding: &'static Encoding,
}

impl Default for LineTailOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            log_file: None,
            encoding: encoding_rs::UTF_8,
        }
    }
}

/// Splits a byte stream into prefixed lines without trailing whitespace.
#[derive(Debug)]
pub struct LineSplitter {
    prefix: String,
    decoder: TextDecoder,
    partial: String,
}

impl LineSplitter {
    pub fn new(prefix: impl Into<String>, encoding: &'static Encoding) -> Self {
        Self {
            prefix: prefix.into(),
            decoder: TextDecoder::new(encoding),
            partial: String::new(),
        }
    }

    /// Feed a chunk; returns the lines it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let text = self.decoder.decode(data);
        self.partial.push_str(&text);
        let Some(end) = self.partial.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(end + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete
            .split_terminator('\n')
            .map(|line| self.format(line))
            .collect()
    }

    /// The unterminated line received so far, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.partial);
        Some(self.format(&line))
    }

    /// End of stream: whatever is left, including an undecodable tail.
    pub fn finish(&mut self) -> Option<String> {
        let text = self.decoder.finish(&[]);
        self.partial.push_str(&text);
        self.flush()
    }

    /// `line` with the prefix and without trailing whitespace.
    pub fn format(&self, line: &str) -> String {
        format!("{}{}", self.prefix, line.trim_end())
    }
}

/// What a listener does with its stream.
trait TailSink: Send + 'static {
    fn output(&mut self, data: &[u8]);

    /// Nothing arrived for the sink's idle interval.
    fn idle(&mut self) {}

    /// End of stream, with the exit status if the helper recorded one.
    fn end(self, status: Option<i32>);
}

struct ChunkSink<F, G> {
    on_output: F,
    on_exit: G,
}

impl<F, G> TailSink for ChunkSink<F, G>
where
    F: FnMut(&[u8]) + Send + 'static,
    G: FnOnce(i32) + Send + 'static,
{
    fn output(&mut self, data: &[u8]) {
        (self.on_output)(data);
    }

    fn end(self, status: Option<i32>) {
        if let Some(status) = status {
            (self.on_exit)(status);
        }
    }
}

struct LineSink<F, G> {
    splitter: LineSplitter,
    log: Option<File>,
    on_line: F,
    on_exit: G,
}

impl<F, G> LineSink<F, G>
where
    F: FnMut(&str) + Send + 'static,
    G: FnOnce(i32) + Send + 'static,
{
    fn emit(&mut self, line: &str) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = writeln!(log, "{line}") {
                tracing::warn!(error = %e, "Failed to write tail log, disabling it");
                self.log = None;
            }
        }
        (self.on_line)(line);
    }
}

impl<F, G> TailSink for LineSink<F, G>
where
    F: FnMut(&str) + Send + 'static,
    G: FnOnce(i32) + Send + 'static,
{
    fn output(&mut self, data: &[u8]) {
        for line in self.splitter.push(data) {
            self.emit(&line);
        }
    }

    fn idle(&mut self) {
        if let Some(line) = self.splitter.flush() {
            self.emit(&line);
        }
    }

    fn end(mut self, status: Option<i32>) {
        if let Some(line) = self.splitter.finish() {
            self.emit(&line);
        }
        let Some(status) = status else {
            return;
        };
        let line = self
            .splitter
            .format(&format!("(Process terminated with status {status})"));
        self.emit(&line);
        (self.on_exit)(status);
    }
}

/// A task forwarding one reader fifo to callbacks.
#[derive(Debug)]
pub struct TailListener {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TailListener {
    /// Start forwarding `receiver` to `on_output`. `on_exit` receives the
    /// exit status once the fifo reaches end-of-stream; it is not called
    /// if no status was recorded or the listener is stopped first.
    pub fn spawn<F, G>(
        name: impl Into<String>,
        receiver: pipe::Receiver,
        status_file: PathBuf,
        on_output: F,
        on_exit: G,
    ) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
        G: FnOnce(i32) + Send + 'static,
    {
        let sink = ChunkSink { on_output, on_exit };
        Self::start(name.into(), receiver, status_file, sink, None)
    }

    /// Like [`spawn`](Self::spawn), but delivers lines formatted per
    /// `options`. An unterminated line is delivered once the stream has
    /// been quiet for [`LINE_IDLE_FLUSH`] and at end-of-stream. A known
    /// exit status is announced as a final
    /// `(Process terminated with status N)` line before `on_exit` runs.
    pub fn spawn_lines<F, G>(
        name: impl Into<String>,
        receiver: pipe::Receiver,
        status_file: PathBuf,
        options: LineTailOptions,
        on_line: F,
        on_exit: G,
    ) -> Self
    where
        F: FnMut(&str) + Send + 'static,
        G: FnOnce(i32) + Send + 'static,
    {
        let name = name.into();
        let log = options.log_file.as_deref().and_then(|path| open_log(&name, path));
        let sink = LineSink {
            splitter: LineSplitter::new(options.prefix, options.encoding),
            log,
            on_line,
            on_exit,
        };
        Self::start(name, receiver, status_file, sink, Some(LINE_IDLE_FLUSH))
    }

    fn start<S: TailSink>(
        name: String,
        mut receiver: pipe::Receiver,
        status_file: PathBuf,
        mut sink: S,
        idle: Option<Duration>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; TAIL_READ_SIZE];
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(reader = %task_name, "Tail listener stopped");
                        return;
                    }
                    read = read_or_idle(&mut receiver, &mut buf, idle) => match read {
                        None => sink.idle(),
                        Some(Ok(0)) => break,
                        Some(Ok(n)) => sink.output(&buf[..n]),
                        Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Some(Err(e)) => {
                            tracing::warn!(reader = %task_name, error = %e, "Tail read failed");
                            break;
                        }
                    }
                }
            }
            let status = read_status(&status_file).await;
            tracing::debug!(reader = %task_name, ?status, "Tail reached end of stream");
            sink.end(status);
        });

        Self { name, cancel, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop forwarding without calling the termination callback.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the listener to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(reader = %self.name, error = %e, "Tail listener panicked");
        }
    }
}

/// Read a chunk, or `None` once `idle` passes without data.
async fn read_or_idle(
    receiver: &mut pipe::Receiver,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> Option<io::Result<usize>> {
    match idle {
        Some(quiet) => tokio::time::timeout(quiet, receiver.read(buf)).await.ok(),
        None => Some(receiver.read(buf).await),
    }
}

fn open_log(reader: &str, path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(reader, path = %path.display(), error = %e, "Failed to open tail log");
            None
        }
    }
}

async fn read_status(path: &Path) -> Option<i32> {
    tokio::fs::read_to_string(path).await.ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use protocol::SessionId;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    /// A session directory with one reader fifo, its receiver and a writer.
    fn reader_fifo(temp: &TempDir, name: &str) -> (SessionLayout, pipe::Receiver, File) {
        let layout = SessionLayout::new(temp.path(), &SessionId::generate());
        std::fs::create_dir_all(layout.dir()).unwrap();
        mkfifo(&layout.reader_pipe(name), Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        let receiver = open_reader(&layout, name).unwrap();
        let writer = OpenOptions::new()
            .write(true)
            .open(layout.reader_pipe(name))
            .unwrap();
        (layout, receiver, writer)
    }

    fn line_sink() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        (lines, move |line: &str| sink.lock().unwrap().push(line.to_string()))
    }

    #[test]
    fn test_line_splitter() {
        let mut splitter = LineSplitter::new("[tail] ", encoding_rs::UTF_8);
        assert!(splitter.push(b"par").is_empty());
        assert_eq!(splitter.push(b"tial  \nnext\r\nx"), vec!["[tail] partial", "[tail] next"]);
        assert_eq!(splitter.flush(), Some("[tail] x".to_string()));
        assert_eq!(splitter.flush(), None);
        assert_eq!(splitter.push(b"\n\n"), vec!["[tail] ", "[tail] "]);
    }

    #[test]
    fn test_line_splitter_holds_split_character() {
        let mut splitter = LineSplitter::new("", encoding_rs::UTF_8);
        let euro = "€".as_bytes();
        assert!(splitter.push(&euro[..1]).is_empty());
        assert_eq!(splitter.flush(), None);
        assert_eq!(splitter.push(&euro[1..]), Vec::<String>::new());
        assert_eq!(splitter.finish(), Some("€".to_string()));
    }

    #[tokio::test]
    async fn test_listener_forwards_until_end_of_stream() {
        let temp = TempDir::new().unwrap();
        let (layout, receiver, mut writer) = reader_fifo(&temp, "tail");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let (tx, rx) = oneshot::channel();
        let listener = TailListener::spawn(
            "tail",
            receiver,
            layout.status_file(),
            move |data| sink.lock().unwrap().extend_from_slice(data),
            move |status| {
                let _ = tx.send(status);
            },
        );

        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world\n").unwrap();
        std::fs::write(layout.status_file(), "3").unwrap();
        drop(writer);

        let status = timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(status, 3);
        assert_eq!(received.lock().unwrap().as_slice(), b"hello world\n");
        listener.join().await;
    }

    #[tokio::test]
    async fn test_line_tail_flushes_idle_prompt_and_reports_status() {
        let temp = TempDir::new().unwrap();
        let (layout, receiver, mut writer) = reader_fifo(&temp, "lines");
        let log_path = temp.path().join("tail.log");

        let (lines, on_line) = line_sink();
        let (tx, rx) = oneshot::channel();
        let options = LineTailOptions {
            prefix: "> ".to_string(),
            log_file: Some(log_path.clone()),
            ..LineTailOptions::default()
        };
        let listener = TailListener::spawn_lines(
            "lines",
            receiver,
            layout.status_file(),
            options,
            on_line,
            move |status| {
                let _ = tx.send(status);
            },
        );

        writer.write_all(b"booting   \nlogin: ").unwrap();
        // the prompt arrives without a newline and nothing follows it
        sleep(LINE_IDLE_FLUSH * 6).await;
        assert_eq!(*lines.lock().unwrap(), vec!["> booting", "> login:"]);

        std::fs::write(layout.status_file(), "0").unwrap();
        drop(writer);

        assert_eq!(timeout(WAIT, rx).await.unwrap().unwrap(), 0);
        listener.join().await;
        let expected = vec![
            "> booting".to_string(),
            "> login:".to_string(),
            "> (Process terminated with status 0)".to_string(),
        ];
        assert_eq!(*lines.lock().unwrap(), expected);
        assert_eq!(
            std::fs::read_to_string(&log_path).unwrap(),
            format!("{}\n", expected.join("\n"))
        );
    }

    #[tokio::test]
    async fn test_line_tail_without_status_skips_exit_callback() {
        let temp = TempDir::new().unwrap();
        let (layout, receiver, mut writer) = reader_fifo(&temp, "lines");

        let (lines, on_line) = line_sink();
        let exited = Arc::new(Mutex::new(false));
        let flag = exited.clone();
        let listener = TailListener::spawn_lines(
            "lines",
            receiver,
            layout.status_file(),
            LineTailOptions::default(),
            on_line,
            move |_| *flag.lock().unwrap() = true,
        );

        writer.write_all(b"last words").unwrap();
        drop(writer);

        timeout(WAIT, listener.join()).await.unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["last words"]);
        assert!(!*exited.lock().unwrap());
    }

    #[tokio::test]
    async fn test_stopped_listener_skips_exit_callback() {
        let temp = TempDir::new().unwrap();
        // the writer stays open so the fifo never reaches end-of-stream
        let (layout, receiver, _writer) = reader_fifo(&temp, "x");
        std::fs::write(layout.status_file(), "0").unwrap();

        let exited = Arc::new(Mutex::new(false));
        let flag = exited.clone();
        let listener = TailListener::spawn(
            "x",
            receiver,
            layout.status_file(),
            |_| {},
            move |_| *flag.lock().unwrap() = true,
        );

        listener.stop();
        listener.join().await;
        assert!(!*exited.lock().unwrap());
    }
}
