//! Failure backoff: per-commit and per-command failure counters.
//!
//! Counters are namespaced by subject kind so a commit and a command with the
//! same id never share a counter. Every read-modify-write happens under a
//! per-subject lock; plain reads for display skip the lock and may be stale.

use std::{
    fmt, fs, io,
    path::PathBuf,
    time::Duration,
};

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    LockError, LockManager, StorageError, read_json, sanitize_id, write_json_atomic,
};

/// Errors from backoff operations.
#[derive(Debug, thiserror::Error)]
pub enum BackoffError {
    #[error("could not lock {subject}: {source}")]
    Lock {
        subject: Subject,
        #[source]
        source: LockError,
    },

    #[error("backoff storage error for {subject}: {source}")]
    Storage {
        subject: Subject,
        #[source]
        source: StorageError,
    },
}

/// What a counter counts failures of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Commit(String),
    Command(String),
}

impl Subject {
    pub fn commit(sha: &str) -> Self {
        Self::Commit(sanitize_id(sha))
    }

    /// A command signature: the command with everything but alphanumerics and
    /// `_.-` stripped, so invocations differing only in quoting, spacing or
    /// paths share a counter.
    pub fn command(command: &str) -> Self {
        Self::Command(sanitize_id(command))
    }

    fn namespace(&self) -> &'static str {
        match self {
            Self::Commit(_) => "commit",
            Self::Command(_) => "command",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Commit(id) | Self::Command(id) => id,
        }
    }

    fn lock_name(&self) -> String {
        format!("backoff.{}.{}", self.namespace(), self.id())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.namespace(), self.id())
    }
}

/// One counter on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub count: u32,
    pub last_updated: Timestamp,
}

/// Whether a subject may be retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Allowed { count: u32 },
    Blocked { count: u32 },
}

/// File-backed failure counters.
#[derive(Debug, Clone)]
pub struct BackoffStore {
    dir: PathBuf,
    locks: LockManager,
    lock_timeout: Duration,
}

impl BackoffStore {
    pub fn new(dir: impl Into<PathBuf>, locks: LockManager, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            locks,
            lock_timeout,
        }
    }

    /// Current count, `0` when absent or unreadable. Does not lock.
    pub fn get(&self, subject: &Subject) -> u32 {
        self.load(subject)
            .ok()
            .flatten()
            .map_or(0, |r| r.count)
    }

    /// Full record, if any. Does not lock.
    pub fn record(&self, subject: &Subject) -> Option<FailureRecord> {
        self.load(subject).ok().flatten()
    }

    /// Adds one failure and returns the new count.
    pub fn increment(&self, subject: &Subject, now: Timestamp) -> Result<u32, BackoffError> {
        let count = self.locked(subject, || {
            let current = self.load(subject)?.map_or(0, |r| r.count);
            let record = FailureRecord {
                count: current.saturating_add(1),
                last_updated: now,
            };
            write_json_atomic(&self.path_for(subject), &record)?;
            Ok(record.count)
        })?;
        debug!(%subject, count, "failure recorded");
        Ok(count)
    }

    /// Clears the counter. Idempotent.
    pub fn reset(&self, subject: &Subject) -> Result<(), BackoffError> {
        self.locked(subject, || match fs::remove_file(self.path_for(subject)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        })?;
        info!(%subject, "failure counter reset");
        Ok(())
    }

    /// Re-reads the counter under the lock and compares it with `max`.
    pub fn check_limit(&self, subject: &Subject, max: u32) -> Result<Limit, BackoffError> {
        let count = self.locked(subject, || Ok(self.load(subject)?.map_or(0, |r| r.count)))?;
        Ok(if count >= max {
            Limit::Blocked { count }
        } else {
            Limit::Allowed { count }
        })
    }

    /// All command counters, highest first. Does not lock.
    pub fn command_counters(&self) -> Vec<(String, FailureRecord)> {
        let dir = self.dir.join("command");
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut out: Vec<(String, FailureRecord)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                let id = path.file_stem()?.to_str()?.to_string();
                let record = read_json::<FailureRecord>(&path).ok()??;
                Some((id, record))
            })
            .collect();
        out.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Deletes counters not updated within `max_age`.
    pub fn purge_older_than(&self, max_age: SignedDuration, now: Timestamp) -> super::Result<usize> {
        let mut removed = 0;
        for namespace in ["commit", "command"] {
            let entries = match fs::read_dir(self.dir.join(namespace)) {
                Ok(e) => e,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let path = entry?.path();
                let Ok(Some(record)) = read_json::<FailureRecord>(&path) else {
                    continue;
                };
                if now.duration_since(record.last_updated) > max_age {
                    match fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(removed)
    }

    fn load(&self, subject: &Subject) -> super::Result<Option<FailureRecord>> {
        read_json(&self.path_for(subject))
    }

    fn locked<T>(
        &self,
        subject: &Subject,
        f: impl FnOnce() -> super::Result<T>,
    ) -> Result<T, BackoffError> {
        self.locks
            .with_lock(&subject.lock_name(), self.lock_timeout, f)
            .map_err(|source| BackoffError::Lock {
                subject: subject.clone(),
                source,
            })?
            .map_err(|source| BackoffError::Storage {
                subject: subject.clone(),
                source,
            })
    }

    fn path_for(&self, subject: &Subject) -> PathBuf {
        self.dir
            .join(subject.namespace())
            .join(format!("{}.json", subject.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{sync::Arc, thread};

    use tempfile::TempDir;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    fn store(dir: &TempDir) -> BackoffStore {
        let locks =
            LockManager::new(dir.path().join("locks")).with_retry_interval(Duration::from_millis(5));
        BackoffStore::new(dir.path().join("backoff"), locks, Duration::from_secs(5))
    }

    #[test]
    fn absent_counter_is_zero() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).get(&Subject::commit("abc")), 0);
    }

    #[test]
    fn increments_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let subject = Subject::commit("abc");

        let mut last = 0;
        for i in 0..5 {
            let count = store.increment(&subject, ts(i)).unwrap();
            assert!(count > last);
            last = count;
        }
        assert_eq!(store.get(&subject), 5);
        assert_eq!(store.record(&subject).unwrap().last_updated, ts(4));
    }

    #[test]
    fn blocks_after_max_consecutive_failures() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let subject = Subject::commit("abc");

        for i in 0..2 {
            store.increment(&subject, ts(i)).unwrap();
            assert!(matches!(store.check_limit(&subject, 3).unwrap(), Limit::Allowed { .. }));
        }
        store.increment(&subject, ts(2)).unwrap();
        assert_eq!(
            store.check_limit(&subject, 3).unwrap(),
            Limit::Blocked { count: 3 }
        );

        store.reset(&subject).unwrap();
        assert_eq!(
            store.check_limit(&subject, 3).unwrap(),
            Limit::Allowed { count: 0 }
        );
        store.reset(&subject).unwrap();
    }

    #[test]
    fn namespaces_are_separate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.increment(&Subject::commit("build"), ts(0)).unwrap();
        assert_eq!(store.get(&Subject::command("build")), 0);
    }

    #[test]
    fn similar_commands_share_a_signature() {
        assert_eq!(
            Subject::command("cargo  build --release"),
            Subject::command("'cargo build --release'")
        );
        assert_ne!(Subject::command("cargo build"), Subject::command("cargo test"));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir));
        let subject = Subject::command("make all");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let subject = subject.clone();
                thread::spawn(move || {
                    for i in 0..5 {
                        store.increment(&subject, ts(i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get(&subject), 20);
    }

    #[test]
    fn lock_timeout_leaves_counter_untouched() {
        let dir = TempDir::new().unwrap();
        let locks =
            LockManager::new(dir.path().join("locks")).with_retry_interval(Duration::from_millis(5));
        let store = BackoffStore::new(dir.path().join("backoff"), locks.clone(), Duration::from_millis(20));
        let subject = Subject::commit("abc");
        store.increment(&subject, ts(0)).unwrap();

        let _held = locks.acquire(&subject.lock_name(), Duration::ZERO).unwrap();
        let err = store.increment(&subject, ts(1)).unwrap_err();

        assert!(matches!(
            err,
            BackoffError::Lock {
                source: LockError::Timeout { .. },
                ..
            }
        ));
        assert_eq!(store.get(&subject), 1);
    }

    #[test]
    fn lists_command_counters_by_count() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.increment(&Subject::command("a"), ts(0)).unwrap();
        store.increment(&Subject::command("b"), ts(0)).unwrap();
        store.increment(&Subject::command("b"), ts(1)).unwrap();

        let ids: Vec<_> = store
            .command_counters()
            .into_iter()
            .map(|(id, r)| (id, r.count))
            .collect();
        assert_eq!(ids, vec![("b".to_string(), 2), ("a".to_string(), 1)]);
    }

    #[test]
    fn purge_drops_stale_counters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.increment(&Subject::commit("old"), ts(0)).unwrap();
        store
            .increment(&Subject::command("new"), ts(29 * 86_400))
            .unwrap();

        let removed = store
            .purge_older_than(SignedDuration::from_hours(30 * 24), ts(31 * 86_400))
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.get(&Subject::commit("old")), 0);
        assert_eq!(store.get(&Subject::command("new")), 1);
    }
}
