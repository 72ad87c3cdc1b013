//! Node-scoped exclusive locks.
//!
//! Every CNI invocation is a separate process, so state shared between pod
//! attachments (the bridge, the port ledger) is serialized with `flock` on a
//! lock file rather than an in-process mutex alone.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use nix::fcntl::{flock, open, FlockArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use tracing::trace;

/// An exclusive `flock` held until drop.
#[derive(Debug)]
pub struct FileLock {
    fd: RawFd,
    path: PathBuf,
}

impl FileLock {
    /// Block until an exclusive lock on `path` is held, creating the file
    /// and its parent directory if needed.
    pub fn exclusive(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let fd = open(
            path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o600),
        )
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if let Err(e) = flock(fd, FlockArg::LockExclusive) {
            let _ = close(fd);
            return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
        }

        trace!(path = %path.display(), "acquired node lock");
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock.
        let _ = close(self.fd);
        trace!(path = %self.path.display(), "released node lock");
    }
}

/// Serializes mutations of one node-scoped object, both between threads of
/// this process and, when a lock file is configured, between processes.
#[derive(Debug, Default)]
pub struct NodeLock {
    path: Option<PathBuf>,
    local: Mutex<()>,
}

/// Held for as long as the node lock is owned.
pub struct NodeLockGuard<'a> {
    _file: Option<FileLock>,
    _local: MutexGuard<'a, ()>,
}

impl NodeLock {
    /// Lock that only serializes threads of this process.
    pub fn in_process() -> Self {
        Self::default()
    }

    /// Lock that also takes an `flock` on `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            local: Mutex::new(()),
        }
    }

    pub fn acquire(&self) -> Result<NodeLockGuard<'_>> {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let file = self
            .path
            .as_deref()
            .map(FileLock::exclusive)
            .transpose()?;
        Ok(NodeLockGuard {
            _file: file,
            _local: local,
        })
    }
}
