//! Idempotency ledger: which events have already been processed.
//!
//! One file per key. The check-and-create is a single exclusive file creation,
//! so two processes racing on the same key cannot both win. Storage failures
//! fail open: the event is processed rather than the pipeline blocked.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::model::Event;

use super::{Result, read_json, write_json_atomic};

/// Deterministic digest identifying one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for a hook event: kind, session, commit, run and attempt, plus the
    /// caller's per-trigger id when the payload carries one.
    pub fn for_event(event: &Event) -> Self {
        let mut parts: Vec<&str> = vec![
            "event",
            event.kind.as_wire(),
            &event.session_id,
            &event.commit_sha,
            &event.run_id,
            &event.run_attempt,
        ];
        if let Some(id) = &event.event_id {
            parts.push(id);
        }
        Self::digest(&parts)
    }

    /// Key for a slash command within a time bucket.
    ///
    /// The same command, arguments and user inside one bucket share a key.
    pub fn for_slash(command: &str, args: &str, user: &str, now: Timestamp, bucket_secs: i64) -> Self {
        let bucket = now.as_second().div_euclid(bucket_secs.max(1)).to_string();
        Self::digest(&["slash", command, args, user, &bucket])
    }

    fn digest(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            // Length-prefix each part so ("ab", "c") and ("a", "bc") differ.
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0[..12])
    }
}

/// What the ledger remembers about a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    pub created_at: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

/// File-backed idempotency ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns `true` if nobody has claimed `key` yet, claiming it atomically.
    ///
    /// Fails open: any storage error yields `true`.
    pub fn should_process(&self, key: &IdempotencyKey, now: Timestamp) -> bool {
        match self.try_claim(key, now) {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(%key, error = %e, "idempotency ledger unavailable, processing anyway");
                true
            }
        }
    }

    fn try_claim(&self, key: &IdempotencyKey, now: Timestamp) -> io::Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_for(key))
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(%key, "duplicate event");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let record = LedgerRecord {
            created_at: now,
            completed_at: None,
        };
        let json = serde_json::to_string_pretty(&record).map_err(io::Error::other)?;
        file.write_all(json.as_bytes())?;
        Ok(true)
    }

    /// Attaches a completion timestamp. Calling it again keeps the first one.
    pub fn mark_complete(&self, key: &IdempotencyKey, now: Timestamp) -> Result<()> {
        let path = self.path_for(key);
        // A claim whose write was cut short reads as corrupt; rewrite it.
        let existing = read_json::<LedgerRecord>(&path).ok().flatten();
        let record = match existing {
            Some(r) if r.completed_at.is_some() => return Ok(()),
            Some(r) => LedgerRecord {
                completed_at: Some(now),
                ..r
            },
            None => LedgerRecord {
                created_at: now,
                completed_at: Some(now),
            },
        };
        write_json_atomic(&path, &record)
    }

    /// Drops a claim so the next delivery is processed again.
    pub fn forget(&self, key: &IdempotencyKey) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    pub fn lookup(&self, key: &IdempotencyKey) -> Result<Option<LedgerRecord>> {
        read_json(&self.path_for(key))
    }

    /// Deletes records created more than `max_age` before `now`.
    ///
    /// Records that vanish or can't be parsed mid-scan are skipped; racing a
    /// concurrent claim is harmless because a fresh record is never old enough.
    pub fn purge_older_than(&self, max_age: SignedDuration, now: Timestamp) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(Some(record)) = read_json::<LedgerRecord>(&path) else {
                continue;
            };
            if now.duration_since(record.created_at) > max_age {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        debug!(removed, "purged idempotency records");
        Ok(removed)
    }

    fn path_for(&self, key: &IdempotencyKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{path::PathBuf, sync::Arc, thread};

    use tempfile::TempDir;

    use crate::{context::Context, model::EventKind};

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    fn event(raw: &str) -> Event {
        let ctx = Context::new(PathBuf::from("/repo"))
            .with_commit("abc")
            .with_run("7", "1");
        Event::parse(EventKind::PreCommand, raw, &ctx).unwrap()
    }

    #[test]
    fn event_key_is_deterministic() {
        let a = IdempotencyKey::for_event(&event(r#"{"session_id": "s"}"#));
        let b = IdempotencyKey::for_event(&event(r#"{"session_id": "s", "extra": 1}"#));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn event_key_separates_sessions_and_trigger_ids() {
        let base = IdempotencyKey::for_event(&event(r#"{"session_id": "s"}"#));
        let other_session = IdempotencyKey::for_event(&event(r#"{"session_id": "t"}"#));
        let with_id = IdempotencyKey::for_event(&event(r#"{"session_id": "s", "tool_use_id": "1"}"#));
        assert_ne!(base, other_session);
        assert_ne!(base, with_id);
    }

    #[test]
    fn slash_key_buckets_time() {
        let a = IdempotencyKey::for_slash("ci-status", "", "alice", ts(0), 60);
        let b = IdempotencyKey::for_slash("ci-status", "", "alice", ts(30), 60);
        let c = IdempotencyKey::for_slash("ci-status", "", "alice", ts(90), 60);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn second_claim_is_refused() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("idempotency"));
        let key = IdempotencyKey::for_slash("x", "", "u", ts(0), 60);

        assert!(ledger.should_process(&key, ts(0)));
        assert!(!ledger.should_process(&key, ts(1)));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::new(dir.path().join("idempotency")));
        let key = IdempotencyKey::for_slash("race", "", "u", ts(0), 60);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let key = key.clone();
                thread::spawn(move || ledger.should_process(&key, ts(0)))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn mark_complete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("idempotency"));
        let key = IdempotencyKey::for_slash("x", "", "u", ts(0), 60);

        ledger.should_process(&key, ts(0));
        ledger.mark_complete(&key, ts(5)).unwrap();
        ledger.mark_complete(&key, ts(9)).unwrap();

        let record = ledger.lookup(&key).unwrap().unwrap();
        assert_eq!(record.created_at, ts(0));
        assert_eq!(record.completed_at, Some(ts(5)));
    }

    #[test]
    fn fails_open_when_storage_is_unusable() {
        let dir = TempDir::new().unwrap();
        // A regular file where the ledger directory should be.
        let blocker = dir.path().join("idempotency");
        fs::write(&blocker, "not a directory").unwrap();
        let ledger = Ledger::new(&blocker);
        let key = IdempotencyKey::for_slash("x", "", "u", ts(0), 60);

        assert!(ledger.should_process(&key, ts(0)));
        assert!(ledger.should_process(&key, ts(0)));
    }

    #[test]
    fn forget_allows_reprocessing() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("idempotency"));
        let key = IdempotencyKey::for_slash("x", "", "u", ts(0), 60);

        assert!(ledger.should_process(&key, ts(0)));
        ledger.forget(&key).unwrap();
        ledger.forget(&key).unwrap();
        assert!(ledger.should_process(&key, ts(1)));
    }

    #[test]
    fn purge_removes_only_old_records() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("idempotency"));
        let old = IdempotencyKey::for_slash("old", "", "u", ts(0), 60);
        let fresh = IdempotencyKey::for_slash("fresh", "", "u", ts(0), 60);

        ledger.should_process(&old, ts(0));
        ledger.should_process(&fresh, ts(6 * 86_400));

        let removed = ledger
            .purge_older_than(SignedDuration::from_hours(7 * 24), ts(8 * 86_400))
            .unwrap();

        assert_eq!(removed, 1);
        assert!(ledger.lookup(&old).unwrap().is_none());
        assert!(ledger.lookup(&fresh).unwrap().is_some());
    }

    #[test]
    fn purge_missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("nope"));
        assert_eq!(
            ledger
                .purge_older_than(SignedDuration::from_hours(1), ts(0))
                .unwrap(),
            0
        );
    }
}
