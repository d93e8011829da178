//! Local persistence for hook state.
//!
//! Everything lives under one state directory inside the repository checkout:
//!
//! ```text
//! <root>/
//!   idempotency/<key>.json        # one record per processed event
//!   backoff/commit/<id>.json      # per-commit failure counters
//!   backoff/command/<sig>.json    # per-command-signature failure counters
//!   locks/<resource>.lock         # advisory OS locks with holder metadata
//!   ratelimit/<user>.json         # last slash-command invocation per user
//!   advisory/usage.jsonl          # advisory requests, for the budget
//!   metrics/pipeline-metrics-<date>.jsonl
//!   audit.jsonl
//!   snapshots/                    # diagnostic snapshots
//! ```
//!
//! The pipeline log lives outside the state root, where the rest of the CI
//! tooling reads it.

mod backoff;
mod budget;
mod journal;
mod ledger;
mod lock;
mod pipeline_log;
mod rate_limit;

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

pub use backoff::{BackoffError, BackoffStore, FailureRecord, Limit, Subject};
pub use budget::{AdvisoryBudget, BudgetDecision, BudgetLimits, UsageSummary};
pub use journal::Journal;
pub use ledger::{IdempotencyKey, Ledger, LedgerRecord};
pub use lock::{ADVISORY_BUDGET, COMMAND_MUTATION, LockError, LockGuard, LockHolder, LockManager};
pub use pipeline_log::{PipelineLog, RotateReport, StatusSink};
pub use rate_limit::{RateDecision, RateLimiter};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}

pub type Result<T> = core::result::Result<T, StorageError>;

/// Root of the on-disk state namespace.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    lock_retry: Duration,
}

impl Storage {
    /// Creates a storage instance rooted at the given directory.
    ///
    /// The directory is created if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock_retry: Duration::from_secs(1),
        })
    }

    /// A handle on `root` that doesn't touch the disk.
    ///
    /// For paths that must keep going when the state directory is unusable:
    /// every store built from it fails open or logs and no-ops.
    pub fn unchecked(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_retry: Duration::from_secs(1),
        }
    }

    /// Overrides the interval between lock acquisition attempts.
    #[must_use]
    pub fn with_lock_retry(mut self, interval: Duration) -> Self {
        self.lock_retry = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Sub-stores ──

    pub fn locks(&self) -> LockManager {
        LockManager::new(self.root.join("locks")).with_retry_interval(self.lock_retry)
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.root.join("idempotency"))
    }

    pub fn backoff(&self, lock_timeout: Duration) -> BackoffStore {
        BackoffStore::new(self.root.join("backoff"), self.locks(), lock_timeout)
    }

    pub fn rate_limiter(&self, window: Duration) -> RateLimiter {
        RateLimiter::new(self.root.join("ratelimit"), self.locks(), window)
    }

    pub fn journal(&self) -> Journal {
        Journal::new(self.root.clone())
    }

    pub fn budget(&self, limits: BudgetLimits) -> AdvisoryBudget {
        AdvisoryBudget::new(self.root.join("advisory").join("usage.jsonl"), limits)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }
}

// ── Shared helpers ──

/// Writes `value` as pretty JSON via a temp file and rename, so readers never
/// see a half-written file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a JSON file, returning `None` if it doesn't exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Reduces an arbitrary identifier to a safe file name: keeps alphanumerics,
/// `_`, `.` and `-`, caps the length, and never returns an empty string.
pub fn sanitize_id(raw: &str) -> String {
    const MAX_LEN: usize = 100;

    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .take(MAX_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "empty".to_string()
    } else {
        cleaned.to_string()
    }
}
