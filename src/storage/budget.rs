//! Request budget for the advisory service.
//!
//! Every advisory request is appended to a JSONL usage file; limits are
//! evaluated against the requests inside a trailing window.

use std::{collections::BTreeMap, path::PathBuf};

use jiff::{SignedDuration, Timestamp};
use tracing::debug;

use crate::model::UsageRecord;

use super::{
    Result,
    journal::{append_line, read_lines},
};

/// Caps applied per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub max_requests_per_day: u32,
    pub max_requests_per_hour: u32,

    /// Minimum gap between two requests; `0` disables.
    pub cooldown_minutes: u32,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_requests_per_day: 10,
            max_requests_per_hour: 3,
            cooldown_minutes: 0,
        }
    }
}

/// Whether another request fits the budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    Allowed,
    Exceeded(Vec<String>),
    Cooldown { remaining_minutes: i64 },
}

/// Usage of one service over a reporting window.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSummary {
    pub service: String,
    pub requests: u32,
    pub cost_usd: f64,
    pub by_user: BTreeMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct AdvisoryBudget {
    path: PathBuf,
    limits: BudgetLimits,
}

impl AdvisoryBudget {
    pub fn new(path: impl Into<PathBuf>, limits: BudgetLimits) -> Self {
        Self {
            path: path.into(),
            limits,
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    pub fn check(&self, service: &str, now: Timestamp) -> Result<BudgetDecision> {
        let records: Vec<UsageRecord> = read_lines::<UsageRecord>(&self.path)?
            .into_iter()
            .filter(|r| r.service == service && r.timestamp <= now)
            .collect();

        let within = |window: SignedDuration| {
            records
                .iter()
                .filter(|r| now.duration_since(r.timestamp) < window)
                .count()
        };
        let daily = within(SignedDuration::from_hours(24));
        let hourly = within(SignedDuration::from_hours(1));

        let mut reasons = Vec::new();
        if daily >= self.limits.max_requests_per_day as usize {
            reasons.push(format!(
                "daily request limit reached ({daily}/{})",
                self.limits.max_requests_per_day
            ));
        }
        if hourly >= self.limits.max_requests_per_hour as usize {
            reasons.push(format!(
                "hourly request limit reached ({hourly}/{})",
                self.limits.max_requests_per_hour
            ));
        }
        if !reasons.is_empty() {
            debug!(service, daily, hourly, "advisory budget exceeded");
            return Ok(BudgetDecision::Exceeded(reasons));
        }

        if self.limits.cooldown_minutes > 0
            && let Some(last) = records.iter().map(|r| r.timestamp).max()
        {
            let cooldown = SignedDuration::from_mins(i64::from(self.limits.cooldown_minutes));
            let remaining = cooldown - now.duration_since(last);
            if remaining.is_positive() {
                // Round up so "0 minutes" is never reported while still cooling down.
                let remaining_minutes = (remaining.as_secs() + 59) / 60;
                return Ok(BudgetDecision::Cooldown { remaining_minutes });
            }
        }

        Ok(BudgetDecision::Allowed)
    }

    pub fn record(&self, service: &str, user: Option<&str>, now: Timestamp) -> Result<()> {
        append_line(
            &self.path,
            &UsageRecord {
                timestamp: now,
                service: service.to_string(),
                user: user.map(str::to_string),
                cost_usd: 0.0,
            },
        )
    }

    /// Per-service usage over the last `days`, optionally for one user.
    pub fn summary(&self, days: u32, user: Option<&str>, now: Timestamp) -> Result<Vec<UsageSummary>> {
        let window = SignedDuration::from_hours(24 * i64::from(days));
        let mut by_service: BTreeMap<String, UsageSummary> = BTreeMap::new();

        for record in read_lines::<UsageRecord>(&self.path)? {
            if now.duration_since(record.timestamp) >= window {
                continue;
            }
            if let Some(user) = user
                && record.user.as_deref() != Some(user)
            {
                continue;
            }
            let entry = by_service
                .entry(record.service.clone())
                .or_insert_with(|| UsageSummary {
                    service: record.service.clone(),
                    requests: 0,
                    cost_usd: 0.0,
                    by_user: BTreeMap::new(),
                });
            entry.requests += 1;
            entry.cost_usd += record.cost_usd;
            if let Some(name) = record.user {
                *entry.by_user.entry(name).or_default() += 1;
            }
        }

        Ok(by_service.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    fn budget(dir: &TempDir, limits: BudgetLimits) -> AdvisoryBudget {
        AdvisoryBudget::new(dir.path().join("advisory").join("usage.jsonl"), limits)
    }

    #[test]
    fn empty_budget_allows() {
        let dir = TempDir::new().unwrap();
        let budget = budget(&dir, BudgetLimits::default());
        assert_eq!(budget.check("gemini", ts(0)).unwrap(), BudgetDecision::Allowed);
    }

    #[test]
    fn hourly_cap_then_recovers() {
        let dir = TempDir::new().unwrap();
        let budget = budget(&dir, BudgetLimits::default());
        for i in 0..3 {
            budget.record("gemini", None, ts(i * 60)).unwrap();
        }

        assert!(matches!(
            budget.check("gemini", ts(300)).unwrap(),
            BudgetDecision::Exceeded(reasons) if reasons[0].contains("hourly")
        ));
        assert_eq!(budget.check("o3", ts(300)).unwrap(), BudgetDecision::Allowed);
        assert_eq!(budget.check("gemini", ts(3600 + 200)).unwrap(), BudgetDecision::Allowed);
    }

    #[test]
    fn daily_cap() {
        let dir = TempDir::new().unwrap();
        let limits = BudgetLimits {
            max_requests_per_day: 2,
            max_requests_per_hour: 100,
            cooldown_minutes: 0,
        };
        let budget = budget(&dir, limits);
        budget.record("gemini", None, ts(0)).unwrap();
        budget.record("gemini", None, ts(7200)).unwrap();

        assert!(matches!(
            budget.check("gemini", ts(10_000)).unwrap(),
            BudgetDecision::Exceeded(reasons) if reasons[0].contains("daily")
        ));
        assert_eq!(budget.check("gemini", ts(86_400 + 1)).unwrap(), BudgetDecision::Allowed);
    }

    #[test]
    fn cooldown_reports_minutes_left() {
        let dir = TempDir::new().unwrap();
        let limits = BudgetLimits {
            cooldown_minutes: 10,
            ..BudgetLimits::default()
        };
        let budget = budget(&dir, limits);
        budget.record("gemini", None, ts(0)).unwrap();

        assert_eq!(
            budget.check("gemini", ts(150)).unwrap(),
            BudgetDecision::Cooldown {
                remaining_minutes: 8
            }
        );
        assert_eq!(budget.check("gemini", ts(600)).unwrap(), BudgetDecision::Allowed);
    }

    #[test]
    fn summary_groups_by_service_and_user() {
        let dir = TempDir::new().unwrap();
        let budget = budget(&dir, BudgetLimits::default());
        budget.record("gemini", Some("alice"), ts(0)).unwrap();
        budget.record("gemini", Some("bob"), ts(10)).unwrap();
        budget.record("o3", Some("alice"), ts(20)).unwrap();
        budget.record("o3", Some("alice"), ts(-10 * 86_400)).unwrap();

        let all = budget.summary(7, None, ts(30)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].service, "gemini");
        assert_eq!(all[0].requests, 2);
        assert_eq!(all[1].requests, 1);

        let alice = budget.summary(7, Some("alice"), ts(30)).unwrap();
        assert_eq!(alice.iter().map(|s| s.requests).sum::<u32>(), 2);
        assert_eq!(alice[0].by_user["alice"], 1);
    }
}
