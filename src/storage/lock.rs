//! Command lock: named, cross-process mutual exclusion.
//!
//! Each resource is a file under the locks directory holding an exclusive
//! OS advisory lock (`flock`). The lock belongs to the open file, so a killed
//! holder releases it automatically when the kernel closes its descriptors.
//! Holder metadata is written into the file for diagnostics only; the OS lock
//! is the source of truth.
//!
//! Acquisition retries at a fixed interval until a deadline and then fails with
//! [`LockError::Timeout`]. It never waits unbounded.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The resource name guarding all state-mutating slash commands.
pub const COMMAND_MUTATION: &str = "command-mutation";

/// Serializes advisory budget checks with the requests they admit.
pub const ADVISORY_BUDGET: &str = "advisory-budget";

/// Errors from lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{resource}'{}", holder_suffix(.holder.as_ref()))]
    Timeout {
        resource: String,
        waited: Duration,
        holder: Option<LockHolder>,
    },

    #[error("invalid lock name '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidName(String),

    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

fn holder_suffix(holder: Option<&LockHolder>) -> String {
    holder.map_or_else(String::new, |h| {
        format!(" (held by pid {} since {})", h.pid, h.acquired_at)
    })
}

/// Who holds a lock. Written into the lock file on acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: Timestamp,
}

/// Hands out named locks under one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    retry_interval: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retry_interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Acquires `resource`, retrying until `timeout` has elapsed.
    ///
    /// A zero timeout makes exactly one attempt.
    pub fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        validate_name(resource)?;
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(resource);
        let started = Instant::now();

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    let guard = LockGuard::new(file, path, resource)?;
                    debug!(resource, waited = ?started.elapsed(), "lock acquired");
                    return Ok(guard);
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let waited = started.elapsed();
            if waited + self.retry_interval > timeout {
                let holder = self.holder(resource);
                warn!(resource, ?waited, ?holder, "lock acquisition timed out");
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited,
                    holder,
                });
            }
            thread::sleep(self.retry_interval);
        }
    }

    /// Runs `f` while holding `resource`. The lock is released on every exit
    /// path, including panics unwinding through `f`.
    pub fn with_lock<T>(
        &self,
        resource: &str,
        timeout: Duration,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        let guard = self.acquire(resource, timeout)?;
        let out = f();
        guard.release();
        Ok(out)
    }

    /// Reads the recorded holder of `resource`, if the lock is currently held.
    ///
    /// Best-effort: for display only.
    pub fn holder(&self, resource: &str) -> Option<LockHolder> {
        let path = self.path_for(resource);
        let file = File::open(&path).ok()?;
        // If we can take a shared lock, nobody holds the exclusive one.
        if FileExt::try_lock_shared(&file).is_ok() {
            let _ = FileExt::unlock(&file);
            return None;
        }
        let contents = fs::read_to_string(&path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn path_for(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{resource}.lock"))
    }
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
    resource: String,
}

impl LockGuard {
    fn new(mut file: File, path: PathBuf, resource: &str) -> Result<Self, LockError> {
        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Timestamp::now(),
        };
        let json = serde_json::to_string(&holder).map_err(io::Error::other)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
        Ok(Self {
            file: Some(file),
            path,
            resource: resource.to_string(),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock now rather than at drop.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Clear holder metadata before unlocking; the next holder rewrites it.
        let _ = file.set_len(0);
        if let Err(e) = FileExt::unlock(&file) {
            warn!(resource = %self.resource, error = %e, "failed to unlock");
        }
        debug!(resource = %self.resource, "lock released");
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn validate_name(resource: &str) -> Result<(), LockError> {
    let valid = !resource.is_empty()
        && !resource.starts_with('.')
        && resource
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(LockError::InvalidName(resource.to_string()))
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
