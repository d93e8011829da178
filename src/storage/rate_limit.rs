//! Per-user rate limiting for slash commands.

use std::{fs, path::PathBuf, time::Duration};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{LockManager, read_json, sanitize_id, write_json_atomic};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastInvocation {
    at: Timestamp,
}

/// One invocation per user per window, remembered on disk.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    dir: PathBuf,
    locks: LockManager,
    window: Duration,
}

impl RateLimiter {
    pub fn new(dir: impl Into<PathBuf>, locks: LockManager, window: Duration) -> Self {
        Self {
            dir: dir.into(),
            locks,
            window,
        }
    }

    /// Records an invocation by `user` unless one happened inside the window.
    ///
    /// A limited call changes nothing. Storage trouble lets the call through.
    pub fn check_and_record(&self, user: &str, now: Timestamp) -> RateDecision {
        let user = sanitize_id(user);
        let result = self
            .locks
            .with_lock(&format!("ratelimit.{user}"), Duration::from_secs(5), || {
                self.check_locked(&user, now)
            });
        match result {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(%user, error = %e, "rate limit state unavailable, allowing");
                RateDecision::Allowed
            }
            Err(e) => {
                warn!(%user, error = %e, "rate limit lock unavailable, allowing");
                RateDecision::Allowed
            }
        }
    }

    /// Withdraws the invocation recorded at `at`, for calls that never got to
    /// run. A newer invocation is left alone.
    pub fn forget(&self, user: &str, at: Timestamp) {
        let user = sanitize_id(user);
        let path = self.dir.join(format!("{user}.json"));
        let result = self
            .locks
            .with_lock(&format!("ratelimit.{user}"), Duration::from_secs(5), || -> super::Result<()> {
                if read_json::<LastInvocation>(&path)?.is_some_and(|last| last.at == at) {
                    fs::remove_file(&path)?;
                }
                Ok(())
            });
        match result {
            Ok(Ok(())) => debug!(%user, "rate limit record withdrawn"),
            Ok(Err(e)) => warn!(%user, error = %e, "could not withdraw rate limit record"),
            Err(e) => warn!(%user, error = %e, "rate limit lock unavailable"),
        }
    }

    fn check_locked(&self, user: &str, now: Timestamp) -> super::Result<RateDecision> {
        let path = self.dir.join(format!("{user}.json"));
        if let Some(last) = read_json::<LastInvocation>(&path)? {
            let elapsed = now.as_second() - last.at.as_second();
            let window = i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX);
            if elapsed >= 0 && elapsed < window {
                let retry_after_secs = u64::try_from(window - elapsed).unwrap_or(0);
                debug!(%user, retry_after_secs, "rate limited");
                return Ok(RateDecision::Limited { retry_after_secs });
            }
        }
        write_json_atomic(&path, &LastInvocation { at: now })?;
        Ok(RateDecision::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    fn limiter(dir: &TempDir) -> RateLimiter {
        let locks = LockManager::new(dir.path().join("locks"))
            .with_retry_interval(Duration::from_millis(5));
        RateLimiter::new(dir.path().join("ratelimit"), locks, Duration::from_secs(30))
    }

    #[test]
    fn second_call_inside_window_is_limited() {
        let dir = TempDir::new().unwrap();
        let limiter = limiter(&dir);

        assert_eq!(limiter.check_and_record("alice", ts(0)), RateDecision::Allowed);
        assert_eq!(
            limiter.check_and_record("alice", ts(10)),
            RateDecision::Limited {
                retry_after_secs: 20
            }
        );
    }

    #[test]
    fn limited_call_does_not_extend_window() {
        let dir = TempDir::new().unwrap();
        let limiter = limiter(&dir);

        limiter.check_and_record("alice", ts(0));
        limiter.check_and_record("alice", ts(29));
        assert_eq!(limiter.check_and_record("alice", ts(31)), RateDecision::Allowed);
    }

    #[test]
    fn forgotten_call_frees_the_window() {
        let dir = TempDir::new().unwrap();
        let limiter = limiter(&dir);

        limiter.check_and_record("alice", ts(0));
        limiter.forget("alice", ts(0));
        assert_eq!(limiter.check_and_record("alice", ts(1)), RateDecision::Allowed);

        // Only the named invocation is withdrawn.
        limiter.forget("alice", ts(0));
        assert!(matches!(
            limiter.check_and_record("alice", ts(2)),
            RateDecision::Limited { .. }
        ));
    }

    #[test]
    fn users_are_independent() {
        let dir = TempDir::new().unwrap();
        let limiter = limiter(&dir);

        limiter.check_and_record("alice", ts(0));
        assert_eq!(limiter.check_and_record("bob", ts(1)), RateDecision::Allowed);
    }

    #[test]
    fn unusable_storage_allows() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ratelimit"), "file, not dir").unwrap();
        let limiter = limiter(&dir);

        assert_eq!(limiter.check_and_record("alice", ts(0)), RateDecision::Allowed);
        assert_eq!(limiter.check_and_record("alice", ts(1)), RateDecision::Allowed);
    }
}
