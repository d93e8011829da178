//! The event router: one external trigger in, handler invocations out.
//!
//! Every event takes the same path:
//!
//! ```text
//! parse → dedup → security precheck → gates → handlers → escalation → mark complete
//! ```
//!
//! Only a gate rejection produces a non-zero exit. Everything else, including
//! malformed input and storage trouble, is absorbed and logged.

mod gates;
mod handler;

use std::{collections::BTreeMap, time::Instant};

use jiff::Timestamp;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    context::Context,
    escalation::{EscalationPolicy, Failure},
    model::{
        AuditRecord, DispatchResult, DispatchStatus, EscalationDecision, Event, EventError,
        EventKind, HandlerOutcome, MetricRecord,
    },
    storage::{IdempotencyKey, Journal, Ledger, StatusSink},
};

pub use gates::{PhaseAlignmentGate, SecurityGate};
pub use handler::{Handler, Registry, ScriptHandler};

/// Routes events through the registry with ledger, audit and metric
/// bookkeeping around each one.
pub struct Dispatcher<'a> {
    ledger: &'a Ledger,
    journal: &'a Journal,
    registry: &'a Registry,
    security: &'a SecurityGate,
    escalation: Option<&'a EscalationPolicy<'a>>,
    status: Option<&'a dyn StatusSink>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        ledger: &'a Ledger,
        journal: &'a Journal,
        registry: &'a Registry,
        security: &'a SecurityGate,
    ) -> Self {
        Self {
            ledger,
            journal,
            registry,
            security,
            escalation: None,
            status: None,
        }
    }

    /// Failed post-commands go through `policy`.
    #[must_use]
    pub fn with_escalation(mut self, policy: &'a EscalationPolicy<'a>) -> Self {
        self.escalation = Some(policy);
        self
    }

    /// Rejections and escalations are also appended to `sink`.
    #[must_use]
    pub fn with_status(mut self, sink: &'a dyn StatusSink) -> Self {
        self.status = Some(sink);
        self
    }

    /// Dispatches one raw event. Always returns a result; never fails.
    pub fn dispatch(&self, kind: &str, raw: impl AsRef<[u8]>, ctx: &Context, now: Timestamp) -> DispatchResult {
        let started = Instant::now();
        let result = self.route(kind, raw.as_ref(), ctx, now);
        info!(event = kind, outcome = result.status.label(), "{}", result.message());
        self.record_metric(kind, &result, started, now);
        result
    }

    fn route(&self, kind: &str, raw: &[u8], ctx: &Context, now: Timestamp) -> DispatchResult {
        let kind = match EventKind::from_wire(kind) {
            Some(EventKind::SlashCommand) => {
                return ignored("slash commands go through the slash executor".to_string());
            }
            Some(kind) => kind,
            None => {
                let expected: Vec<_> = EventKind::INGESTED.iter().map(|k| k.as_wire()).collect();
                let err = EventError::UnknownKind(kind.to_string());
                warn!(error = %err, "event ignored");
                return ignored(format!("{err} (expected one of: {})", expected.join(", ")));
            }
        };
        let event = match Event::parse(kind, raw, ctx) {
            Ok(event) => event,
            Err(e) => {
                warn!(event = %kind, error = %e, "malformed payload ignored");
                return ignored(e.to_string());
            }
        };

        let key = IdempotencyKey::for_event(&event);
        if !self.ledger.should_process(&key, now) {
            debug!(event = %kind, %key, "duplicate event skipped");
            return DispatchResult::new(DispatchStatus::SkippedDuplicate);
        }

        if let Some(reason) = self.security.check(&event) {
            self.audit_rejection(&event, &reason, now);
            return self.reject(&event, &key, SecurityGate::NAME, reason, now);
        }

        let mut handlers_run = 0;
        let mut failures = 0;
        for handler in self.registry.ordered(kind) {
            if !handler.applies_to(&event) {
                continue;
            }
            handlers_run += 1;
            let HandlerOutcome::Failed { exit_code, message } = handler.handle(&event, ctx) else {
                continue;
            };
            if handler.is_gate() {
                return self.reject(&event, &key, handler.name(), message, now);
            }
            failures += 1;
            warn!(event = %kind, handler = handler.name(), ?exit_code, %message, "handler failed");
        }

        let mut result = DispatchResult::new(DispatchStatus::Completed {
            handlers_run,
            failures,
        });
        if kind == EventKind::PostCommand {
            result.escalation = self.after_command(&event, ctx, now);
        }

        if let Err(e) = self.ledger.mark_complete(&key, now) {
            warn!(%key, error = %e, "could not mark event complete");
        }
        result
    }

    /// Feeds a finished command into the escalation policy.
    fn after_command(&self, event: &Event, ctx: &Context, now: Timestamp) -> Option<EscalationDecision> {
        let policy = self.escalation?;
        let command = event.command.as_deref().or(event.tool_name.as_deref())?;
        match event.exit_code {
            Some(0) => {
                policy.on_success(command);
                None
            }
            Some(code) => {
                let error_text = event.error_text();
                let decision = policy.on_failure(
                    Failure {
                        command,
                        error_text: &error_text,
                        exit_code: Some(code),
                    },
                    ctx,
                    now,
                );
                let details = json!({
                    "command": command,
                    "exit_code": code,
                    "commit_sha": event.commit_sha,
                    "decision": decision,
                });
                self.append_status("escalation", details, now);
                Some(decision)
            }
            None => None,
        }
    }

    fn reject(
        &self,
        event: &Event,
        key: &IdempotencyKey,
        gate: &str,
        reason: String,
        now: Timestamp,
    ) -> DispatchResult {
        // Forget the claim so a re-delivery is judged by the gates again.
        if let Err(e) = self.ledger.forget(key) {
            warn!(%key, error = %e, "could not release rejected event");
        }
        let details = json!({
            "event": event.kind.as_wire(),
            "gate": gate,
            "reason": reason,
            "session_id": event.session_id,
            "commit_sha": event.commit_sha,
        });
        self.append_status("gate-rejected", details, now);
        DispatchResult::new(DispatchStatus::Rejected {
            gate: gate.to_string(),
            reason,
        })
    }

    fn audit_rejection(&self, event: &Event, reason: &str, now: Timestamp) {
        let record = AuditRecord::new(now, "security-gate", event.kind.as_wire(), "rejected")
            .field("reason", reason)
            .field("session_id", event.session_id.clone())
            .field("commit_sha", event.commit_sha.clone())
            .field("run_id", event.run_id.clone());
        if let Err(e) = self.journal.append_audit(&record) {
            warn!(error = %e, "could not write audit record");
        }
    }

    fn append_status(&self, kind: &str, details: serde_json::Value, now: Timestamp) {
        if let Some(sink) = self.status
            && let Err(e) = sink.append(kind, details, now)
        {
            warn!(kind, error = %e, "could not append to status log");
        }
    }

    fn record_metric(&self, kind: &str, result: &DispatchResult, started: Instant, now: Timestamp) {
        let millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let record = MetricRecord {
            timestamp: now,
            name: "hook.dispatch".to_string(),
            value: millis,
            tags: BTreeMap::from([
                ("kind".to_string(), kind.to_string()),
                ("outcome".to_string(), result.status.label().to_string()),
            ]),
        };
        if let Err(e) = self.journal.append_metric(&record) {
            debug!(error = %e, "could not record dispatch metric");
        }
    }
}

fn ignored(reason: String) -> DispatchResult {
    DispatchResult::new(DispatchStatus::Ignored { reason })
}
