//! Batch lock artifact.
//!
//! A JSON file created with create-new semantics before the store is touched
//! and removed when the guard drops. Finding it already present means another
//! batch is running (or crashed without cleanup and needs an operator).

use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process id of the holder.
    pub pid: u32,
    /// When the lock was taken.
    pub created: DateTime<Utc>,
}

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct BatchLock {
    path: PathBuf,
}

/// Result of [`BatchLock::acquire`].
#[derive(Debug)]
pub enum LockAttempt {
    /// The lock is ours.
    Acquired(BatchLock),
    /// Someone else holds it; their info if readable.
    Held(Option<LockInfo>),
}

impl BatchLock {
    /// Try to create the lock file at `path`.
    ///
    /// An existing file yields [`LockAttempt::Held`]; any other failure is an error.
    pub fn acquire(path: &Path, now: DateTime<Utc>) -> anyhow::Result<LockAttempt> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create lock directory {}", parent.display()))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = Self::read(path);
                warn!(
                    lock = %path.display(),
                    holder_pid = holder.as_ref().map(|h| h.pid),
                    "batch lock present; another run is active"
                );
                return Ok(LockAttempt::Held(holder));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("create lock file {}", path.display()));
            }
        };
        let lock = BatchLock {
            path: path.to_path_buf(),
        };
        let info = LockInfo {
            pid: std::process::id(),
            created: now,
        };
        let bytes = serde_json::to_vec(&info)?;
        file.write_all(&bytes)
            .with_context(|| format!("write lock file {}", path.display()))?;
        debug!(lock = %path.display(), "batch lock acquired");
        Ok(LockAttempt::Acquired(lock))
    }

    /// Read a lock file's contents, if present and well formed.
    pub fn read(path: &Path) -> Option<LockInfo> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Lock file location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BatchLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to remove batch lock");
        }
    }
}
