//! Advisory, TTL-based locking of a release tree.
//!
//! A lock is a `.lock` file in the tree root holding the acquisition time as
//! unix seconds. Creation uses `create_new`, so exactly one acquirer wins when
//! several race for an absent lock. A lock older than the TTL belongs to a
//! crashed holder and is reclaimed by whoever notices it first.
//!
//! This coordinates processes on one host only.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths;

pub const DEFAULT_TTL: Duration = Duration::from_secs(1800);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Progress reported while acquiring a contended lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// A live lock is held by someone else; the caller will sleep and retry.
    Waiting { path: PathBuf, age: Duration },
    /// A stale lock was deleted.
    Reclaimed { path: PathBuf, age: Duration },
}

#[derive(Debug, Clone)]
pub struct LockCoordinator {
    ttl: Duration,
    retry_interval: Duration,
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_timing(ttl: Duration, retry_interval: Duration) -> Self {
        Self {
            ttl,
            retry_interval,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire the lock of `tree`, waiting while a live lock exists.
    ///
    /// Iterates (never recurses) until the lock is free or stale. The tree
    /// directory is created if it does not exist yet.
    pub fn acquire(
        &self,
        tree: &Path,
        mut on_event: impl FnMut(&LockEvent),
    ) -> Result<LockGuard> {
        fs::create_dir_all(tree)
            .map_err(|e| Error::internal_io(e.to_string(), Some("create lock directory".to_string())))?;
        let path = paths::lock_file(tree);

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(now_stamp().to_string().as_bytes())
                        .and_then(|_| file.flush())
                        .map_err(|e| {
                            Error::internal_io(e.to_string(), Some("write lock".to_string()))
                        })?;
                    return Ok(LockGuard {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(Error::internal_io(
                        e.to_string(),
                        Some("create lock".to_string()),
                    ))
                }
            }

            let Some((stamp, age)) = read_lock(&path) else {
                // Released between our attempt and the read.
                continue;
            };

            if age >= self.ttl {
                if reclaim(&path, &stamp) {
                    on_event(&LockEvent::Reclaimed {
                        path: path.clone(),
                        age,
                    });
                }
                continue;
            }

            on_event(&LockEvent::Waiting {
                path: path.clone(),
                age,
            });
            thread::sleep(self.retry_interval);
        }
    }

    /// Remove the lock of `tree` if present. Never fails.
    pub fn release(tree: &Path) {
        remove_lock_file(&paths::lock_file(tree));
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            remove_lock_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn now_stamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Raw lock content and its age. None when the lock no longer exists.
fn read_lock(path: &Path) -> Option<(String, Duration)> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(_) => String::new(),
    };

    let acquired_at = content
        .trim()
        .parse::<i64>()
        .ok()
        .or_else(|| modified_stamp(path));

    let age = match acquired_at {
        Some(at) => Duration::from_secs((now_stamp() - at).max(0) as u64),
        // Unreadable and undatable: treat as abandoned.
        None => Duration::MAX,
    };

    Some((content, age))
}

fn modified_stamp(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let datetime: chrono::DateTime<chrono::Utc> = modified.into();
    Some(datetime.timestamp())
}

/// Delete a stale lock unless another process replaced it since we read it.
fn reclaim(path: &Path, observed: &str) -> bool {
    match fs::read_to_string(path) {
        Ok(current) if current == observed => {
            remove_lock_file(path);
            true
        }
        _ => false,
    }
}

fn remove_lock_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            log_status!("lock", "Failed to remove {}: {}", path.display(), e);
        }
    }
}
