//! Advisory service client: the expensive escalation path.
//!
//! The core only hands a request off. Delivery is fire-and-forget through a
//! configured command, and every request passes the budget first.

use std::{path::PathBuf, time::Duration};

use jiff::Timestamp;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    process::{self, ProcessError},
    storage::{ADVISORY_BUDGET, AdvisoryBudget, BudgetDecision, LockError, LockManager, StorageError},
};

/// Errors from an advisory request.
#[derive(Debug, thiserror::Error)]
pub enum AdvisoryError {
    #[error("no advisory command configured")]
    NotConfigured,

    #[error("advisory budget refused {service}: {reason}")]
    Budget { service: String, reason: String },

    #[error("advisory command failed: {0}")]
    Process(#[from] ProcessError),

    #[error("advisory request encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// What gets handed to the advisory service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryRequest {
    pub service: String,
    pub reason: String,
    pub requested_at: Timestamp,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_excerpt: Option<String>,

    pub failure_count: u32,
    pub commit_sha: String,
    pub session_id: String,
}

/// Anything that can accept an advisory request.
pub trait AdvisoryClient {
    fn request(&self, request: &AdvisoryRequest) -> Result<(), AdvisoryError>;
}

/// Hands the request, as JSON on stdin, to a configured command and returns
/// without waiting for it.
#[derive(Debug, Clone)]
pub struct CommandAdvisory {
    argv: Vec<String>,
    cwd: PathBuf,
}

impl CommandAdvisory {
    pub fn new(argv: Vec<String>, cwd: PathBuf) -> Self {
        Self { argv, cwd }
    }
}

impl AdvisoryClient for CommandAdvisory {
    fn request(&self, request: &AdvisoryRequest) -> Result<(), AdvisoryError> {
        if self.argv.is_empty() {
            return Err(AdvisoryError::NotConfigured);
        }
        let payload = serde_json::to_vec(request)?;
        let pid = process::spawn_detached(&self.argv, &self.cwd, &payload)?;
        info!(service = %request.service, pid, "advisory request dispatched");
        Ok(())
    }
}

/// Wraps a client with the request budget: refused requests never reach it,
/// accepted ones are recorded.
///
/// Check, delivery and record happen under one lock, so concurrent hooks
/// can't all pass against the same usage file.
pub struct Budgeted<C> {
    inner: C,
    budget: AdvisoryBudget,
    locks: LockManager,
    lock_timeout: Duration,
}

impl<C> Budgeted<C> {
    pub fn new(inner: C, budget: AdvisoryBudget, locks: LockManager, lock_timeout: Duration) -> Self {
        Self {
            inner,
            budget,
            locks,
            lock_timeout,
        }
    }
}

impl<C: AdvisoryClient> Budgeted<C> {
    fn admit(&self, request: &AdvisoryRequest) -> Result<(), AdvisoryError> {
        let refusal = match self.budget.check(&request.service, request.requested_at)? {
            BudgetDecision::Allowed => None,
            BudgetDecision::Exceeded(reasons) => Some(reasons.join("; ")),
            BudgetDecision::Cooldown { remaining_minutes } => {
                Some(format!("cooldown, {remaining_minutes} minute(s) left"))
            }
        };
        if let Some(reason) = refusal {
            warn!(service = %request.service, %reason, "advisory request refused by budget");
            return Err(AdvisoryError::Budget {
                service: request.service.clone(),
                reason,
            });
        }

        self.inner.request(request)?;
        if let Err(e) = self.budget.record(
            &request.service,
            request.requested_by.as_deref(),
            request.requested_at,
        ) {
            warn!(error = %e, "could not record advisory usage");
        }
        Ok(())
    }
}

impl<C: AdvisoryClient> AdvisoryClient for Budgeted<C> {
    fn request(&self, request: &AdvisoryRequest) -> Result<(), AdvisoryError> {
        self.locks
            .with_lock(ADVISORY_BUDGET, self.lock_timeout, || self.admit(request))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::{
        cell::RefCell,
        fs,
        sync::{
            Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use tempfile::TempDir;

    use crate::storage::BudgetLimits;

    /// Records requests instead of sending them.
    #[derive(Default)]
    pub(crate) struct RecordingAdvisory {
        pub requests: RefCell<Vec<AdvisoryRequest>>,
        pub fail: bool,
    }

    impl AdvisoryClient for RecordingAdvisory {
        fn request(&self, request: &AdvisoryRequest) -> Result<(), AdvisoryError> {
            if self.fail {
                return Err(AdvisoryError::NotConfigured);
            }
            self.requests.borrow_mut().push(request.clone());
            Ok(())
        }
    }

    pub(crate) fn request(service: &str, at: Timestamp) -> AdvisoryRequest {
        AdvisoryRequest {
            service: service.into(),
            reason: "test".into(),
            requested_at: at,
            requested_by: Some("alice".into()),
            command: None,
            error_excerpt: None,
            failure_count: 3,
            commit_sha: "abc".into(),
            session_id: "s".into(),
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    fn budgeted<C>(inner: C, dir: &TempDir, limits: BudgetLimits) -> Budgeted<C> {
        Budgeted::new(
            inner,
            AdvisoryBudget::new(dir.path().join("usage.jsonl"), limits),
            LockManager::new(dir.path().join("locks")).with_retry_interval(Duration::from_millis(5)),
            Duration::from_secs(5),
        )
    }

    /// Counts deliveries; shareable across threads.
    #[derive(Default)]
    struct CountingAdvisory(AtomicUsize);

    impl AdvisoryClient for CountingAdvisory {
        fn request(&self, _: &AdvisoryRequest) -> Result<(), AdvisoryError> {
            // Widen the window between check and record.
            thread::sleep(Duration::from_millis(20));
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn budget_refuses_and_records() {
        let dir = TempDir::new().unwrap();
        let limits = BudgetLimits {
            max_requests_per_day: 10,
            max_requests_per_hour: 1,
            cooldown_minutes: 0,
        };
        let budgeted = budgeted(RecordingAdvisory::default(), &dir, limits);

        budgeted.request(&request("gemini", ts(0))).unwrap();
        let err = budgeted.request(&request("gemini", ts(60))).unwrap_err();

        assert!(matches!(err, AdvisoryError::Budget { .. }));
        assert_eq!(budgeted.inner.requests.borrow().len(), 1);
    }

    #[test]
    fn failed_delivery_is_not_counted() {
        let dir = TempDir::new().unwrap();
        let budgeted = budgeted(
            RecordingAdvisory {
                fail: true,
                ..RecordingAdvisory::default()
            },
            &dir,
            BudgetLimits::default(),
        );

        assert!(budgeted.request(&request("gemini", ts(0))).is_err());
        assert!(budgeted.budget.summary(1, None, ts(1)).unwrap().is_empty());
    }

    #[test]
    fn concurrent_requests_respect_the_hourly_cap() {
        let dir = TempDir::new().unwrap();
        let limits = BudgetLimits {
            max_requests_per_day: 10,
            max_requests_per_hour: 1,
            cooldown_minutes: 0,
        };
        let budgeted = budgeted(CountingAdvisory::default(), &dir, limits);
        let barrier = Barrier::new(4);

        let accepted: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        budgeted.request(&request("gemini", ts(0))).is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(accepted, 1);
        assert_eq!(budgeted.inner.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn command_client_pipes_request_json() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("request.json");
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", out.display()),
        ];
        let client = CommandAdvisory::new(argv, dir.path().to_path_buf());

        client.request(&request("o3", ts(0))).unwrap();

        let mut written = String::new();
        for _ in 0..200 {
            written = fs::read_to_string(&out).unwrap_or_default();
            if written.ends_with('}') {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(written.contains(r#""service":"o3""#));
    }

    #[test]
    fn unconfigured_command_client() {
        let client = CommandAdvisory::new(Vec::new(), PathBuf::from("."));
        assert!(matches!(
            client.request(&request("o3", ts(0))),
            Err(AdvisoryError::NotConfigured)
        ));
    }
}
