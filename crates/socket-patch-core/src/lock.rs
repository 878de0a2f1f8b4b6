//! Cross-process advisory locking over a filesystem path.
//!
//! A lock is a directory: creating it is the exclusion primitive, its
//! presence means "held", and an mtime older than the stale threshold means
//! the holder is presumed dead and the lock may be reclaimed.
//!
//! `mkdir` exclusivity is not guaranteed on every network filesystem; on such
//! mounts two processes may both believe they hold the lock.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::error::PatchError;

/// Retry and staleness settings for [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Upper bound for a single retry delay.
    pub max_delay: Duration,
    /// Age after which an existing lock is considered abandoned.
    pub stale: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            stale: Duration::from_secs(10),
        }
    }
}

impl LockOptions {
    /// Un-jittered delay before retry number `attempt` (0-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let scale = 0.5 + rand::random::<f64>() * 0.5;
        self.backoff(attempt).mul_f64(scale)
    }
}

/// A held lock.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub path: PathBuf,
    pub acquired_at: DateTime<Utc>,
    pub stale: Duration,
}

/// What we found at a lock path that we failed to create.
enum ExistingLock {
    Held,
    Stale(Duration),
    Gone,
}

/// Directory-based lock manager.
///
/// Keeps a registry of the lock paths this process holds so the host can
/// force-release them on shutdown via [`LockManager::release_all`].
#[derive(Debug, Default)]
pub struct LockManager {
    held: DashMap<PathBuf, LockHandle>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock at `lock_path`, retrying with jittered exponential
    /// backoff and reclaiming it if it is stale.
    #[instrument(skip_all, level = "debug", fields(path = %lock_path.as_ref().display()))]
    pub async fn acquire(
        &self,
        lock_path: impl AsRef<Path>,
        options: &LockOptions,
    ) -> Result<LockHandle, PatchError> {
        let path = lock_path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                PatchError::Io(format!("Failed to create dir {}: {}", parent.display(), e))
            })?;
        }

        let mut retries_used = 0u32;
        // Reclaims skip the backoff but are capped so a pathological
        // filesystem cannot spin us forever.
        let mut reclaims_left = options.retries.saturating_add(1);

        loop {
            match fs::create_dir(&path).await {
                Ok(()) => {
                    let handle = LockHandle {
                        path: path.clone(),
                        acquired_at: Utc::now(),
                        stale: options.stale,
                    };
                    self.held.insert(path.clone(), handle.clone());
                    debug!("Acquired lock {}", path.display());
                    return Ok(handle);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(PatchError::Io(format!(
                        "Failed to create lock {}: {}",
                        path.display(),
                        e
                    )))
                }
            }

            if reclaims_left > 0 {
                match inspect_lock(&path, options.stale).await {
                    ExistingLock::Gone => {
                        reclaims_left -= 1;
                        continue;
                    }
                    ExistingLock::Stale(age) => {
                        reclaims_left -= 1;
                        match reclaim_stale(&path, options.stale).await {
                            Ok(true) => {
                                debug!(
                                    "Reclaimed stale lock {} (age {:?})",
                                    path.display(),
                                    age
                                );
                                continue;
                            }
                            // Another contender is reclaiming it, or already did.
                            Ok(false) => {}
                            Err(e) => {
                                debug!("Failed to reclaim stale lock {}: {}", path.display(), e);
                            }
                        }
                    }
                    ExistingLock::Held => {}
                }
            }

            if retries_used >= options.retries {
                return Err(PatchError::LockAcquisition {
                    path: path.display().to_string(),
                    attempts: retries_used + 1,
                });
            }

            let delay = options.jittered_backoff(retries_used);
            debug!(
                "Lock {} is held, retry {} in {:?}",
                path.display(),
                retries_used + 1,
                delay
            );
            tokio::time::sleep(delay).await;
            retries_used += 1;
        }
    }

    /// Release the lock at `lock_path`. Releasing a lock that is already gone
    /// is not an error.
    #[instrument(skip_all, level = "debug", fields(path = %lock_path.as_ref().display()))]
    pub async fn release(&self, lock_path: impl AsRef<Path>) -> Result<(), PatchError> {
        let path = lock_path.as_ref();
        self.held.remove(path);

        match fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!("Released lock {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Lock {} already released", path.display());
                Ok(())
            }
            Err(e) => Err(PatchError::Io(format!(
                "Failed to release lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Bump the lock's modification time so a long-running holder is not
    /// mistaken for a dead one.
    pub async fn refresh(&self, lock_path: impl AsRef<Path>) -> Result<(), PatchError> {
        let path = lock_path.as_ref().to_path_buf();
        if !self.held.contains_key(&path) {
            return Err(PatchError::Internal(format!(
                "Lock {} is not held by this process",
                path.display()
            )));
        }

        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || {
            let dir = std::fs::File::open(&path)?;
            dir.set_modified(SystemTime::now())
        })
        .await
        .map_err(|e| PatchError::Internal(format!("Refresh task failed: {}", e)))?
        .map_err(|e| PatchError::Io(format!("Failed to refresh lock {}: {}", display, e)))
    }

    /// Run `f` while holding the lock at `lock_path`.
    ///
    /// The lock is released on every exit path. A panic inside `f` is resumed
    /// after the release.
    pub async fn with_lock<F, Fut, T>(
        &self,
        lock_path: impl AsRef<Path>,
        options: &LockOptions,
        f: F,
    ) -> Result<T, PatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PatchError>>,
    {
        let path = lock_path.as_ref();
        self.acquire(path, options).await?;

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        let released = self.release(path).await;

        match outcome {
            Ok(Ok(value)) => released.map(|()| value),
            Ok(Err(e)) => {
                if let Err(release_err) = released {
                    warn!("Failed to release lock after error: {}", release_err);
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(release_err) = released {
                    warn!("Failed to release lock after panic: {}", release_err);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Paths of every lock currently held by this manager.
    pub fn held_locks(&self) -> Vec<PathBuf> {
        self.held.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Force-release every held lock. Best effort and synchronous so it can
    /// run from a shutdown hook; failures are ignored.
    pub fn release_all(&self) {
        let paths = self.held_locks();
        for path in paths {
            self.held.remove(&path);
            let _ = std::fs::remove_dir_all(&path);
        }
    }
}

/// Sibling directory held while deleting a stale lock.
fn reclaim_guard_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".reclaim");
    path.with_file_name(name)
}

/// Delete the lock at `path` if it is still stale.
///
/// Only one contender at a time holds the reclaim guard, and staleness is
/// checked again under it, so a lock that another contender has just
/// re-created is never deleted. Returns whether the path is now free.
async fn reclaim_stale(path: &Path, stale: Duration) -> std::io::Result<bool> {
    let guard = reclaim_guard_path(path);
    match fs::create_dir(&guard).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // A reclaimer that died mid-reclaim leaves its guard behind.
            if let ExistingLock::Stale(_) = inspect_lock(&guard, stale).await {
                let _ = fs::remove_dir(&guard).await;
            }
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    let freed = match inspect_lock(path, stale).await {
        ExistingLock::Stale(_) => match fs::remove_dir_all(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        },
        ExistingLock::Gone => Ok(true),
        ExistingLock::Held => Ok(false),
    };

    if let Err(e) = fs::remove_dir(&guard).await {
        warn!("Failed to remove reclaim guard {}: {}", guard.display(), e);
    }
    freed
}

async fn inspect_lock(path: &Path, stale: Duration) -> ExistingLock {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ExistingLock::Gone,
        Err(e) => {
            warn!("Failed to inspect lock {}: {}", path.display(), e);
            return ExistingLock::Held;
        }
    };

    let Ok(modified) = metadata.modified() else {
        return ExistingLock::Held;
    };

    // An mtime in the future reads as fresh.
    match SystemTime::now().duration_since(modified) {
        Ok(age) if age > stale => ExistingLock::Stale(age),
        _ => ExistingLock::Held,
    }
}
