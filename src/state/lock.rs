//! PID-aware advisory file lock protecting the session-state file across
//! processes. Grounded on the exclusive-create-then-check-staleness protocol:
//! a sibling `<path>.lock` file holds `pid:timestamp_ms`; a stale holder (dead
//! PID, or a lock older than 80% of the timeout) is reclaimed rather than
//! waited out forever.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::errors::StateStoreError;

const INITIAL_BACKOFF_MS: u64 = 50;
const BACKOFF_FACTOR: u32 = 2;
const MAX_BACKOFF_MS: u64 = 500;

/// An acquired lock; releasing is unlinking the lock file, which must never
/// fail just because someone else already removed it.
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Blocks (cooperatively, via async sleeps) until the lock is acquired or
    /// `timeout` elapses, in which case `StateStoreError::LockTimeout` is
    /// returned.
    pub async fn acquire(state_path: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = lock_path_for(state_path);
        let deadline = Instant::now() + timeout;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match try_create_exclusive(&lock_path) {
                Ok(()) => return Ok(FileLock { lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if reclaim_if_stale(&lock_path, timeout)? {
                        continue;
                    }
                }
                Err(e) => {
                    return Err(StateStoreError::WriteFailed {
                        path: lock_path,
                        source: e,
                    }
                    .into());
                }
            }

            if Instant::now() >= deadline {
                return Err(StateStoreError::LockTimeout {
                    path: state_path.to_path_buf(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }

            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * BACKOFF_FACTOR as u64).min(MAX_BACKOFF_MS);
        }
    }

    pub fn release(self) {
        // Dropping does the work; named for symmetry with `acquire`.
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(state_path: &Path) -> PathBuf {
    let mut s = state_path.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

fn try_create_exclusive(lock_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    let pid = std::process::id();
    let now_ms = now_millis();
    write!(file, "{}:{}", pid, now_ms)?;
    Ok(())
}

/// Returns `Ok(true)` when a stale lock was removed and the caller should
/// retry immediately; `Ok(false)` when the lock is live and the caller should
/// back off.
fn reclaim_if_stale(lock_path: &Path, timeout: Duration) -> Result<bool> {
    let contents = match std::fs::read_to_string(lock_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => {
            return Err(StateStoreError::ReadFailed {
                path: lock_path.to_path_buf(),
                source: e,
            }
            .into());
        }
    };

    let pid = contents
        .split(':')
        .next()
        .and_then(|s| s.parse::<u32>().ok());

    if let Some(pid) = pid
        && !pid_is_alive(pid)
    {
        remove_lock_best_effort(lock_path);
        return Ok(true);
    }

    let mtime = std::fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .context("failed to stat lock file")?;
    let age = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO);
    let stale_threshold = Duration::from_secs_f64(timeout.as_secs_f64() * 0.8);

    if age >= stale_threshold {
        remove_lock_best_effort(lock_path);
        return Ok(true);
    }

    Ok(false)
}

fn remove_lock_best_effort(lock_path: &Path) {
    let _ = std::fs::remove_file(lock_path);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Best-effort PID liveness check. On Unix, `kill(pid, 0)` returning success
/// or `EPERM` both mean "alive"; `ESRCH` means gone. Any other platform, or a
/// syscall we can't interpret, treats the process as alive — we'd rather wait
/// out a false positive than clobber a live holder's lock.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    !matches!(std::io::Error::last_os_error().raw_os_error(), Some(e) if e == libc::ESRCH)
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}
