//! State inspection and maintenance: counters, phase, status log, budget and audit.

use clap::{Subcommand, ValueEnum};
use jiff::{SignedDuration, Timestamp};
use serde_json::Value;

use crate::{model::PipelinePhase, storage::Subject};

use super::{
    Runtime,
    format::{format_audit, format_counters, format_phase, format_rotate, format_usage},
};

#[derive(Debug, Subcommand)]
pub enum BackoffCommand {
    /// Show this commit's counter and every command counter.
    Show,

    /// Clear one counter.
    Reset {
        #[arg(value_enum)]
        kind: CounterArg,

        /// Commit SHA or command signature.
        id: String,
    },
}

/// CLI-facing counter namespace, mapped to the domain `Subject`.
#[derive(Debug, Clone, ValueEnum)]
pub enum CounterArg {
    Commit,
    Command,
}

impl CounterArg {
    fn to_subject(&self, id: &str) -> Subject {
        match self {
            Self::Commit => Subject::commit(id),
            Self::Command => Subject::command(id),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum PhaseCommand {
    /// Print the current phase.
    Get,

    /// Make a phase current. The previous one moves into the history.
    Set {
        /// Phase id, e.g. `phase-3`.
        id: String,

        /// Display name, e.g. `Package`.
        name: String,

        #[arg(long, default_value = "in_progress")]
        status: String,

        /// Completion between 0 and 1.
        #[arg(long)]
        progress: Option<f64>,
    },
}

#[derive(Debug, Subcommand)]
pub enum StatusCommand {
    /// Append one activity to the pipeline log.
    Append {
        /// Activity type, e.g. `build-started`.
        kind: String,

        /// Details as a JSON value.
        #[arg(default_value = "{}")]
        details: String,
    },

    /// Archive and trim the pipeline log when it is too big or too old.
    Rotate {
        #[arg(long, default_value_t = 30)]
        max_age_days: u32,

        #[arg(long, default_value_t = 5)]
        max_size_mb: u64,

        /// Report what would happen without touching the log.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum BudgetCommand {
    /// Summarize advisory requests per service.
    Status {
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Only count this user's requests.
        #[arg(long)]
        user: Option<String>,
    },
}

pub(super) fn cmd_backoff(rt: &Runtime, command: BackoffCommand) -> Result<(), String> {
    let backoff = rt.backoff();
    match command {
        BackoffCommand::Show => {
            let commit = backoff.get(&Subject::commit(&rt.ctx.commit_sha));
            let commands = backoff.command_counters();
            print!(
                "{}",
                format_counters(
                    &rt.ctx.commit_sha,
                    commit,
                    rt.config.backoff.commit_ceiling,
                    &commands
                )
            );
            Ok(())
        }
        BackoffCommand::Reset { kind, id } => {
            let subject = kind.to_subject(&id);
            backoff
                .reset(&subject)
                .map_err(|e| format!("failed to reset {subject}: {e}"))?;
            println!("Reset {subject}");
            Ok(())
        }
    }
}

pub(super) fn cmd_phase(rt: &Runtime, command: PhaseCommand) -> Result<(), String> {
    match command {
        PhaseCommand::Get => {
            let phase = rt
                .pipeline_log
                .current_phase()
                .map_err(|e| format!("failed to read pipeline log: {e}"))?;
            match phase {
                Some(phase) => println!("{}", format_phase(&phase)),
                None => println!("No current phase"),
            }
            Ok(())
        }
        PhaseCommand::Set {
            id,
            name,
            status,
            progress,
        } => {
            let mut phase = PipelinePhase::new(id, name, status);
            if let Some(progress) = progress {
                phase = phase.with_progress(progress);
            }
            rt.pipeline_log
                .set_phase(phase.clone(), Timestamp::now())
                .map_err(|e| format!("failed to set phase: {e}"))?;
            println!("{}", format_phase(&phase));
            Ok(())
        }
    }
}

pub(super) fn cmd_status(rt: &Runtime, command: StatusCommand) -> Result<(), String> {
    match command {
        StatusCommand::Append { kind, details } => {
            let details: Value = serde_json::from_str(&details)
                .map_err(|e| format!("details must be valid JSON: {e}"))?;
            rt.pipeline_log
                .append(&kind, details, Timestamp::now())
                .map_err(|e| format!("failed to append to pipeline log: {e}"))?;
            println!("Appended {kind} to {}", rt.pipeline_log.path().display());
            Ok(())
        }
        StatusCommand::Rotate {
            max_age_days,
            max_size_mb,
            dry_run,
        } => {
            let max_age = SignedDuration::from_hours(24 * i64::from(max_age_days));
            let report = rt
                .pipeline_log
                .rotate(max_age, max_size_mb * 1024 * 1024, dry_run, Timestamp::now())
                .map_err(|e| format!("failed to rotate pipeline log: {e}"))?;
            println!("{}", format_rotate(&report, dry_run));
            Ok(())
        }
    }
}

pub(super) fn cmd_purge(rt: &Runtime) -> Result<(), String> {
    let now = Timestamp::now();
    let days = |n: u32| SignedDuration::from_hours(24 * i64::from(n));

    let records = rt
        .storage
        .ledger()
        .purge_older_than(days(rt.config.ledger.retention_days), now)
        .map_err(|e| format!("failed to purge idempotency records: {e}"))?;
    let counters = rt
        .backoff()
        .purge_older_than(days(rt.config.backoff.retention_days), now)
        .map_err(|e| format!("failed to purge failure counters: {e}"))?;

    println!("Purged {records} idempotency record(s), {counters} failure counter(s)");
    Ok(())
}

pub(super) fn cmd_budget(rt: &Runtime, command: BudgetCommand) -> Result<(), String> {
    match command {
        BudgetCommand::Status { days, user } => {
            let budget = rt.storage.budget(rt.config.advisory.limits());
            let usage = budget
                .summary(days, user.as_deref(), Timestamp::now())
                .map_err(|e| format!("failed to read advisory usage: {e}"))?;
            print!("{}", format_usage(&usage, days, budget.limits()));
            Ok(())
        }
    }
}

pub(super) fn cmd_audit(rt: &Runtime, limit: usize) -> Result<(), String> {
    let records = rt
        .storage
        .journal()
        .read_audit()
        .map_err(|e| format!("failed to read audit trail: {e}"))?;
    if records.is_empty() {
        println!("No audit entries");
        return Ok(());
    }
    let skip = records.len().saturating_sub(limit);
    for record in &records[skip..] {
        println!("{}", format_audit(record));
    }
    Ok(())
}
