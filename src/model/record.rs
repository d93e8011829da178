//! Typed records written to append-only logs.
//!
//! Field names match the JSON the CI tooling already reads
//! (`timestamp`, `type`, `details`, `name`, `value`), so external readers
//! keep working.

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PipelinePhase;

/// One entry in the pipeline log's activity list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusActivity {
    pub timestamp: Timestamp,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub details: Value,
}

/// The whole pipeline log document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineLogDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PipelinePhase>,

    #[serde(default)]
    pub activities: Vec<StatusActivity>,

    #[serde(default)]
    pub phase_history: Vec<PipelinePhase>,

    /// Keys written by other tooling, carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// An audit trail entry: security rejections and slash-command invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: Timestamp,

    /// What was audited, e.g. `security-gate` or `slash-command`.
    pub category: String,

    pub subject: String,
    pub outcome: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(
        timestamp: Timestamp,
        category: impl Into<String>,
        subject: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            category: category.into(),
            subject: subject.into(),
            outcome: outcome.into(),
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A single metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub timestamp: Timestamp,
    pub name: String,
    pub value: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// One advisory request counted against the budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: Timestamp,
    pub service: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub cost_usd: f64,
}
