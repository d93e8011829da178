//! Output formatting for CLI display.

use std::fmt::Write as _;

use crate::{
    model::{AuditRecord, DispatchResult, PipelinePhase},
    storage::{BudgetLimits, FailureRecord, RotateReport, UsageSummary},
};

/// One line for the hook's stderr.
pub(super) fn format_dispatch(result: &DispatchResult) -> String {
    format!("hookline: {}", result.message())
}

pub(super) fn format_phase(phase: &PipelinePhase) -> String {
    let percent = (phase.progress * 100.0).round();
    let mut line = format!("{}  {}  [{}]  {percent}%", phase.id, phase.name, phase.status);
    if let Some(started) = phase.started_at {
        let _ = write!(line, "  since {}", started.strftime("%Y-%m-%d %H:%M UTC"));
    }
    line
}

pub(super) fn format_counters(
    commit_sha: &str,
    commit_failures: u32,
    ceiling: u32,
    commands: &[(String, FailureRecord)],
) -> String {
    let mut out = String::new();
    let blocked = if commit_failures >= ceiling { "  (blocked)" } else { "" };
    let _ = writeln!(out, "Commit {commit_sha}: {commit_failures}/{ceiling} failures{blocked}");

    if commands.is_empty() {
        out.push_str("No command counters\n");
        return out;
    }
    for (id, record) in commands {
        let _ = writeln!(
            out,
            "{:>4}  {id}  (last {})",
            record.count,
            record.last_updated.strftime("%Y-%m-%d %H:%M")
        );
    }
    out
}

pub(super) fn format_usage(usage: &[UsageSummary], days: u32, limits: BudgetLimits) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Advisory usage, last {days} day(s):");
    if usage.is_empty() {
        out.push_str("  no requests\n");
    }
    for summary in usage {
        let _ = writeln!(
            out,
            "  {}: {} request(s), ${:.2}",
            summary.service, summary.requests, summary.cost_usd
        );
        for (user, count) in &summary.by_user {
            let _ = writeln!(out, "    {user}: {count}");
        }
    }
    let _ = write!(
        out,
        "Limits: {}/day, {}/hour",
        limits.max_requests_per_day, limits.max_requests_per_hour
    );
    if limits.cooldown_minutes > 0 {
        let _ = write!(out, ", {} minute cooldown", limits.cooldown_minutes);
    }
    out.push('\n');
    out
}

pub(super) fn format_rotate(report: &RotateReport, dry_run: bool) -> String {
    let Some(reason) = &report.reason else {
        return format!("No rotation needed ({} bytes)", report.size_bytes);
    };
    if dry_run {
        return format!("Would rotate: {reason}");
    }
    match &report.archived_to {
        Some(archive) => format!(
            "Rotated: {reason}; archived to {}, removed {} entr{}",
            archive.display(),
            report.removed,
            if report.removed == 1 { "y" } else { "ies" }
        ),
        None => format!("Rotated: {reason}"),
    }
}

pub(super) fn format_audit(record: &AuditRecord) -> String {
    let mut line = format!(
        "{}  {:<14} {:<18} {}",
        record.timestamp.strftime("%Y-%m-%d %H:%M:%S"),
        record.category,
        record.subject,
        record.outcome
    );
    for (key, value) in &record.fields {
        let _ = write!(line, "  {key}={value}");
    }
    line
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::PathBuf};

    use jiff::Timestamp;

    use super::*;
    use crate::model::DispatchStatus;

    #[test]
    fn dispatch_line_carries_the_reason() {
        let result = DispatchResult::new(DispatchStatus::Rejected {
            gate: "security".into(),
            reason: "matched forbidden pattern 'mkfs'".into(),
        });
        assert_eq!(
            format_dispatch(&result),
            "hookline: blocked by security: matched forbidden pattern 'mkfs'"
        );
    }

    #[test]
    fn phase_line() {
        let phase = PipelinePhase::new("phase-2", "Test", "in_progress").with_progress(0.4);
        assert_eq!(format_phase(&phase), "phase-2  Test  [in_progress]  40%");

        let mut started = phase;
        started.started_at = Some("2026-03-01T12:30:00Z".parse::<Timestamp>().unwrap());
        assert!(format_phase(&started).ends_with("since 2026-03-01 12:30 UTC"));
    }

    #[test]
    fn counters_mark_blocked_commit() {
        let record = FailureRecord {
            count: 4,
            last_updated: "2026-03-01T08:00:00Z".parse().unwrap(),
        };
        let out = format_counters("abc123", 3, 3, &[("make_test".into(), record)]);
        assert!(out.starts_with("Commit abc123: 3/3 failures  (blocked)\n"));
        assert!(out.contains("   4  make_test  (last 2026-03-01 08:00)"));

        let empty = format_counters("abc123", 1, 3, &[]);
        assert_eq!(empty, "Commit abc123: 1/3 failures\nNo command counters\n");
    }

    #[test]
    fn usage_lists_users_and_limits() {
        let usage = vec![UsageSummary {
            service: "gemini".into(),
            requests: 3,
            cost_usd: 0.0,
            by_user: BTreeMap::from([("alice".to_string(), 2), ("bob".to_string(), 1)]),
        }];
        let limits = BudgetLimits {
            cooldown_minutes: 15,
            ..BudgetLimits::default()
        };

        let out = format_usage(&usage, 7, limits);

        assert!(out.contains("  gemini: 3 request(s), $0.00\n    alice: 2\n    bob: 1\n"));
        assert!(out.ends_with("Limits: 10/day, 3/hour, 15 minute cooldown\n"));
        assert!(format_usage(&[], 1, BudgetLimits::default()).contains("no requests"));
    }

    #[test]
    fn audit_line_lists_fields() {
        let record = AuditRecord::new(
            "2026-03-01T09:15:00Z".parse().unwrap(),
            "slash-command",
            "ci-retry-job",
            "completed",
        )
        .field("user", "alice")
        .field("args", "build");

        assert_eq!(
            format_audit(&record),
            "2026-03-01 09:15:00  slash-command  ci-retry-job       completed  args=build  user=alice"
        );
    }

    #[test]
    fn rotate_report_wording() {
        let idle = RotateReport {
            size_bytes: 120,
            ..RotateReport::default()
        };
        assert_eq!(format_rotate(&idle, false), "No rotation needed (120 bytes)");

        let due = RotateReport {
            size_bytes: 9_000_000,
            reason: Some("size 9000000 bytes exceeds 5242880 byte limit".into()),
            archived_to: Some(PathBuf::from("/repo/archive/pipeline-log-20260301-120000.json")),
            removed: 1,
        };
        assert!(format_rotate(&due, true).starts_with("Would rotate: size"));
        assert!(format_rotate(&due, false).ends_with("removed 1 entry"));
    }
}
