//! Core data model for hookline.
//!
//! Events flow in, outcomes flow out; everything persisted is one of the
//! record types here.

mod event;
mod known_issue;
mod outcome;
mod phase;
mod record;

pub use event::{Event, EventError, EventKind};
pub use known_issue::{CatalogFile, KnownIssue};
pub use outcome::{
    DispatchResult, DispatchStatus, EXIT_BLOCK, EscalationDecision, HandlerOutcome, Remedy,
};
pub use phase::PipelinePhase;
pub use record::{AuditRecord, MetricRecord, PipelineLogDocument, StatusActivity, UsageRecord};
