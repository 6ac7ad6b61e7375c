//! Incremental reads of the output log.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Position in the output log up to which a controller has consumed output.
///
/// Bytes before the cursor are never handed out again.
#[derive(Debug, Clone)]
pub struct LogCursor {
    path: PathBuf,
    offset: u64,
}

impl LogCursor {
    /// Cursor at the start of the log.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::at(path, 0)
    }

    pub fn at(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read everything appended since the last read and advance past it.
    /// A missing log reads as empty.
    pub async fn read_new(&mut self) -> io::Result<Vec<u8>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    /// Move to the current end of the log, discarding unread output.
    pub async fn skip_to_end(&mut self) -> io::Result<()> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => self.offset = meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
