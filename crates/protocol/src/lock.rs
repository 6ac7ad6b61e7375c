//! Advisory locks coordinating helpers and controllers.
//!
//! Two locks exist per session:
//!
//! - `server-running` is held by the helper from before it announces
//!   readiness until after it has closed its channels. A free lock means the
//!   output log and status file are final.
//! - `client-starting` is held by a controller while it attaches its reader
//!   fifos. The helper will not close its channels while it is held.
//!
//! [`SessionLocks`] is the seam; [`FileLocks`] is the production
//! implementation on top of `flock(2)` and [`MemoryLocks`] is an in-process
//! stand-in for tests.

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use fs2::FileExt;

use crate::error::LockError;
use crate::layout::SessionLayout;

/// The two locks of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    ServerRunning,
    ClientStarting,
}

impl LockKind {
    /// Name of the backing file inside the session directory.
    pub fn file_name(self) -> &'static str {
        match self {
            LockKind::ServerRunning => "lock-server-running",
            LockKind::ClientStarting => "lock-client-starting",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Exclusive advisory locks, keyed by [`LockKind`].
pub trait SessionLocks: Send + Sync {
    /// Proof of ownership; dropping it without [`release`](Self::release)
    /// also frees the lock.
    type Handle: Send;

    /// Take the lock without blocking. Fails with
    /// [`LockError::Unavailable`] if someone else holds it.
    fn acquire(&self, kind: LockKind) -> Result<Self::Handle, LockError>;

    /// Give a lock back.
    fn release(&self, handle: Self::Handle) -> Result<(), LockError>;

    /// Block until nobody holds the lock.
    fn wait_until_free(&self, kind: LockKind) -> Result<(), LockError>;

    /// Whether someone currently holds the lock.
    fn is_held(&self, kind: LockKind) -> Result<bool, LockError>;
}

impl<T: SessionLocks> SessionLocks for Arc<T> {
    type Handle = T::Handle;

    fn acquire(&self, kind: LockKind) -> Result<Self::Handle, LockError> {
        (**self).acquire(kind)
    }

    fn release(&self, handle: Self::Handle) -> Result<(), LockError> {
        (**self).release(handle)
    }

    fn wait_until_free(&self, kind: LockKind) -> Result<(), LockError> {
        (**self).wait_until_free(kind)
    }

    fn is_held(&self, kind: LockKind) -> Result<bool, LockError> {
        (**self).is_held(kind)
    }
}

/// `flock(2)` locks on files in the session directory.
#[derive(Debug, Clone)]
pub struct FileLocks {
    server_running: PathBuf,
    client_starting: PathBuf,
}

/// An acquired [`FileLocks`] lock.
#[derive(Debug)]
pub struct FileLockHandle {
    kind: LockKind,
    file: File,
}

impl FileLockHandle {
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl FileLocks {
    pub fn new(layout: &SessionLayout) -> Self {
        Self {
            server_running: layout.lock_file(LockKind::ServerRunning),
            client_starting: layout.lock_file(LockKind::ClientStarting),
        }
    }

    fn path(&self, kind: LockKind) -> &Path {
        match kind {
            LockKind::ServerRunning => &self.server_running,
            LockKind::ClientStarting => &self.client_starting,
        }
    }

    fn create(&self, kind: LockKind) -> Result<File, LockError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path(kind))
            .map_err(|e| self.io_error(kind, e))
    }

    /// Open an existing lock file, `None` if there is none.
    fn open(&self, kind: LockKind) -> Result<Option<File>, LockError> {
        match OpenOptions::new().read(true).write(true).open(self.path(kind)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(kind, e)),
        }
    }

    fn io_error(&self, kind: LockKind, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path(kind).to_path_buf(),
            source,
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl SessionLocks for FileLocks {
    type Handle = FileLockHandle;

    fn acquire(&self, kind: LockKind) -> Result<FileLockHandle, LockError> {
        let file = self.create(kind)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::trace!(lock = %kind, "Lock acquired");
                Ok(FileLockHandle { kind, file })
            }
            Err(e) if is_contended(&e) => Err(LockError::Unavailable(kind)),
            Err(e) => Err(self.io_error(kind, e)),
        }
    }

    fn release(&self, handle: FileLockHandle) -> Result<(), LockError> {
        FileExt::unlock(&handle.file).map_err(|e| self.io_error(handle.kind, e))?;
        tracing::trace!(lock = %handle.kind, "Lock released");
        Ok(())
    }

    fn wait_until_free(&self, kind: LockKind) -> Result<(), LockError> {
        // a missing lock file cannot be held
        let Some(file) = self.open(kind)? else {
            return Ok(());
        };
        FileExt::lock_exclusive(&file).map_err(|e| self.io_error(kind, e))?;
        FileExt::unlock(&file).map_err(|e| self.io_error(kind, e))
    }

    fn is_held(&self, kind: LockKind) -> Result<bool, LockError> {
        let Some(file) = self.open(kind)? else {
            return Ok(false);
        };
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                FileExt::unlock(&file).map_err(|e| self.io_error(kind, e))?;
                Ok(false)
            }
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(self.io_error(kind, e)),
        }
    }
}

/// In-process locks with the same semantics as [`FileLocks`].
#[derive(Debug, Default)]
pub struct MemoryLocks {
    held: Mutex<HashSet<LockKind>>,
    freed: Condvar,
}

/// An acquired [`MemoryLocks`] lock.
#[derive(Debug)]
pub struct MemoryLockHandle {
    kind: LockKind,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<LockKind>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionLocks for MemoryLocks {
    type Handle = MemoryLockHandle;

    fn acquire(&self, kind: LockKind) -> Result<MemoryLockHandle, LockError> {
        let mut held = self.held();
        if !held.insert(kind) {
            return Err(LockError::Unavailable(kind));
        }
        Ok(MemoryLockHandle { kind })
    }

    fn release(&self, handle: MemoryLockHandle) -> Result<(), LockError> {
        self.held().remove(&handle.kind);
        self.freed.notify_all();
        Ok(())
    }

    fn wait_until_free(&self, kind: LockKind) -> Result<(), LockError> {
        let mut held = self.held();
        while held.contains(&kind) {
            held = self
                .freed
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        Ok(())
    }

    fn is_held(&self, kind: LockKind) -> Result<bool, LockError> {
        Ok(self.held().contains(&kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SessionId;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn file_locks() -> (TempDir, FileLocks) {
        let temp = TempDir::new().unwrap();
        let layout = SessionLayout::new(temp.path(), &SessionId::generate());
        std::fs::create_dir_all(layout.dir()).unwrap();
        let locks = FileLocks::new(&layout);
        (temp, locks)
    }

    #[test]
    fn test_file_lock_is_exclusive() {
        let (_temp, locks) = file_locks();
        let other = locks.clone();

        let handle = locks.acquire(LockKind::ServerRunning).unwrap();
        assert!(matches!(
            other.acquire(LockKind::ServerRunning),
            Err(LockError::Unavailable(LockKind::ServerRunning))
        ));
        // the other lock is independent
        let client = other.acquire(LockKind::ClientStarting).unwrap();

        locks.release(handle).unwrap();
        assert!(other.acquire(LockKind::ServerRunning).is_ok());
        other.release(client).unwrap();
    }

    #[test]
    fn test_file_lock_is_held() {
        let (_temp, locks) = file_locks();
        assert!(!locks.is_held(LockKind::ServerRunning).unwrap());

        let handle = locks.acquire(LockKind::ServerRunning).unwrap();
        assert!(locks.is_held(LockKind::ServerRunning).unwrap());
        assert!(!locks.is_held(LockKind::ClientStarting).unwrap());

        drop(handle);
        assert!(!locks.is_held(LockKind::ServerRunning).unwrap());
    }

    #[test]
    fn test_file_lock_wait_until_free() {
        let (_temp, locks) = file_locks();
        let handle = locks.acquire(LockKind::ClientStarting).unwrap();

        let waiter = locks.clone();
        let start = Instant::now();
        let join = thread::spawn(move || waiter.wait_until_free(LockKind::ClientStarting));

        thread::sleep(Duration::from_millis(150));
        assert!(!join.is_finished());
        locks.release(handle).unwrap();

        join.join().unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_missing_lock_file_is_free() {
        let temp = TempDir::new().unwrap();
        let layout = SessionLayout::new(temp.path(), &SessionId::generate());
        let locks = FileLocks::new(&layout);
        assert!(!locks.is_held(LockKind::ServerRunning).unwrap());
        locks.wait_until_free(LockKind::ServerRunning).unwrap();
    }

    #[test]
    fn test_memory_locks() {
        let locks = Arc::new(MemoryLocks::new());
        let handle = locks.acquire(LockKind::ClientStarting).unwrap();
        assert!(locks.is_held(LockKind::ClientStarting).unwrap());
        assert!(locks.acquire(LockKind::ClientStarting).is_err());

        let waiter = Arc::clone(&locks);
        let join = thread::spawn(move || waiter.wait_until_free(LockKind::ClientStarting));
        thread::sleep(Duration::from_millis(50));
        assert!(!join.is_finished());

        locks.release(handle).unwrap();
        join.join().unwrap().unwrap();
        assert!(!locks.is_held(LockKind::ClientStarting).unwrap());
    }
}
