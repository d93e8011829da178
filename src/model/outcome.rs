//! Outcome types: what handlers, dispatches, and escalations produced.

use std::fmt;

use serde::Serialize;

/// What a single handler reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    Failed { exit_code: Option<i32>, message: String },
}

impl HandlerOutcome {
    pub fn failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self::Failed {
            exit_code,
            message: message.into(),
        }
    }
}

/// Terminal state of one dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Gates passed and every handler ran. `failures` counts non-gate handlers
    /// that exited non-zero.
    Completed { handlers_run: usize, failures: usize },

    /// The idempotency key was already recorded.
    SkippedDuplicate,

    /// A blocking gate failed; the triggering action must not proceed.
    Rejected { gate: String, reason: String },

    /// The payload could not be understood. Treated as success.
    Ignored { reason: String },
}

impl DispatchStatus {
    /// Short label used in metrics and audit records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::SkippedDuplicate => "skipped-duplicate",
            Self::Rejected { .. } => "rejected",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Exit code that blocks the triggering tool action.
pub const EXIT_BLOCK: u8 = 2;

/// Aggregate result of dispatching one event.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub status: DispatchStatus,

    /// Set when a failed post-command went through the escalation policy.
    pub escalation: Option<EscalationDecision>,
}

impl DispatchResult {
    pub fn new(status: DispatchStatus) -> Self {
        Self {
            status,
            escalation: None,
        }
    }

    /// The process exit code for this result. Only gate rejections are non-zero.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            DispatchStatus::Rejected { .. } => EXIT_BLOCK,
            _ => 0,
        }
    }

    /// One-line human-readable summary.
    pub fn message(&self) -> String {
        let base = match &self.status {
            DispatchStatus::Completed {
                handlers_run,
                failures: 0,
            } => format!("completed ({handlers_run} handler(s))"),
            DispatchStatus::Completed {
                handlers_run,
                failures,
            } => format!("completed ({handlers_run} handler(s), {failures} failed)"),
            DispatchStatus::SkippedDuplicate => "skipped: already processed".to_string(),
            DispatchStatus::Rejected { gate, reason } => format!("blocked by {gate}: {reason}"),
            DispatchStatus::Ignored { reason } => format!("ignored: {reason}"),
        };
        match &self.escalation {
            Some(decision) => format!("{base}; {decision}"),
            None => base,
        }
    }
}

/// Which remediation path the escalation policy took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "remedy", rename_all = "kebab-case")]
pub enum Remedy {
    /// A known issue's auto-fix ran and succeeded.
    AutoFixed { issue_id: String },

    /// A known issue's auto-fix ran and failed.
    AutoFixFailed { issue_id: String, error: String },

    /// Matched a known issue that has no auto-fix.
    KnownIssue { issue_id: String },

    /// An advisory request was sent.
    Escalated,

    /// Escalation was warranted but the advisory call was refused or failed.
    EscalationDeferred { reason: String },

    /// Recorded, nothing automated done.
    Unclassified,
}

/// The policy's full verdict on one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationDecision {
    #[serde(flatten)]
    pub remedy: Remedy,

    pub command_failures: u32,
    pub commit_failures: u32,

    /// Set when the commit reached its failure ceiling: automated retries
    /// for this commit must stop.
    pub halt: Option<String>,
}

impl fmt::Display for EscalationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remedy {
            Remedy::AutoFixed { issue_id } => write!(f, "auto-fixed known issue {issue_id}")?,
            Remedy::AutoFixFailed { issue_id, error } => {
                write!(f, "auto-fix for {issue_id} failed: {error}")?;
            }
            Remedy::KnownIssue { issue_id } => write!(f, "known issue {issue_id}")?,
            Remedy::Escalated => f.write_str("escalated to advisory")?,
            Remedy::EscalationDeferred { reason } => write!(f, "escalation deferred: {reason}")?,
            Remedy::Unclassified => f.write_str("unclassified failure")?,
        }
        write!(
            f,
            " (command failures: {}, commit failures: {})",
            self.command_failures, self.commit_failures
        )?;
        if let Some(halt) = &self.halt {
            write!(f, "; {halt}")?;
        }
        Ok(())
    }
}
