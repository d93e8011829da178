//! Slash-command executor.
//!
//! A request passes, in order: name validation, argument validation, the
//! per-user rate limit, the idempotency ledger, and (for mutating commands)
//! the command-mutation lock. Only then does the command run. Every request
//! is audited, whatever happened to it.

mod validate;

use std::{
    fmt::Write as _,
    fs, io,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use jiff::Timestamp;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    advisory::{AdvisoryClient, AdvisoryRequest},
    config::Config,
    context::Context,
    escalation::halt_text,
    github::CommentPoster,
    model::AuditRecord,
    storage::{
        AdvisoryBudget, BackoffStore, COMMAND_MUTATION, IdempotencyKey, Journal, Ledger, Limit,
        LockError, LockManager, PipelineLog, RateDecision, RateLimiter, Storage, Subject,
    },
};

pub use validate::ValidationError;

use validate::{ArgKind, validate_arg, validate_name};

/// Exit code for a rate-limited request.
pub const EXIT_RATE_LIMITED: u8 = 69;

/// Exit code for a lock timeout. Retryable.
pub const EXIT_LOCK_TIMEOUT: u8 = 75;

// ── Commands ──

struct CommandSpec {
    name: &'static str,
    arg: ArgKind,
    mutating: bool,
    summary: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "ci-help",
        arg: ArgKind::None,
        mutating: false,
        summary: "list available commands",
    },
    CommandSpec {
        name: "ci-status",
        arg: ArgKind::None,
        mutating: false,
        summary: "current phase, commit failures and lock holder",
    },
    CommandSpec {
        name: "ci-usage",
        arg: ArgKind::OptionalUsername,
        mutating: false,
        summary: "advisory usage over the last week",
    },
    CommandSpec {
        name: "ci-pr-status",
        arg: ArgKind::PrNumber,
        mutating: false,
        summary: "post the status summary to a pull request",
    },
    CommandSpec {
        name: "ci-retry-job",
        arg: ArgKind::JobName,
        mutating: true,
        summary: "reset a job's failure counter and request a retry",
    },
    CommandSpec {
        name: "ci-reset-phase",
        arg: ArgKind::PhaseId,
        mutating: true,
        summary: "put a phase back to pending",
    },
    CommandSpec {
        name: "ci-clear-cache",
        arg: ArgKind::None,
        mutating: true,
        summary: "remove the CI cache directories",
    },
    CommandSpec {
        name: "ci-clear-backoff",
        arg: ArgKind::None,
        mutating: true,
        summary: "reset this commit's failure counter",
    },
    CommandSpec {
        name: "ci-review",
        arg: ArgKind::Service,
        mutating: true,
        summary: "request an advisory review",
    },
];

// ── Requests and outcomes ──

/// One slash-command invocation.
#[derive(Debug, Clone, Copy)]
pub struct SlashRequest<'a> {
    pub command: &'a str,
    pub args: &'a str,
    pub user: &'a str,

    /// The pull request the command was issued on, for the reply.
    pub pr_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashStatus {
    Completed,

    /// Already handled inside the current time bucket.
    Duplicate,

    Invalid(ValidationError),
    RateLimited { retry_after_secs: u64 },
    LockTimeout,
    Failed,
}

impl SlashStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
            Self::Invalid(_) => "invalid",
            Self::RateLimited { .. } => "rate-limited",
            Self::LockTimeout => "lock-timeout",
            Self::Failed => "failed",
        }
    }
}

/// What the executor did with a request.
#[derive(Debug, Clone)]
pub struct SlashOutcome {
    pub status: SlashStatus,

    /// Human-readable reply.
    pub message: String,
}

impl SlashOutcome {
    fn new(status: SlashStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn invalid(error: ValidationError) -> Self {
        let message = error.to_string();
        Self::new(SlashStatus::Invalid(error), message)
    }

    pub fn exit_code(&self) -> u8 {
        match self.status {
            SlashStatus::Completed | SlashStatus::Duplicate => 0,
            SlashStatus::Invalid(_) | SlashStatus::Failed => 1,
            SlashStatus::RateLimited { .. } => EXIT_RATE_LIMITED,
            SlashStatus::LockTimeout => EXIT_LOCK_TIMEOUT,
        }
    }
}

// ── Executor ──

/// Knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct SlashSettings {
    pub dedup_bucket_secs: i64,
    pub lock_timeout: Duration,
    pub commit_ceiling: u32,

    /// Absolute cache directories cleared by `ci-clear-cache`.
    pub cache_dirs: Vec<PathBuf>,

    pub usage_days: u32,
}

impl SlashSettings {
    pub fn from_config(config: &Config, repo_root: &Path) -> Self {
        Self {
            dedup_bucket_secs: config.slash.dedup_bucket_secs,
            lock_timeout: config.lock.timeout(),
            commit_ceiling: config.backoff.commit_ceiling,
            cache_dirs: config
                .paths
                .cache_dirs
                .iter()
                .map(|dir| Config::resolve(repo_root, dir))
                .collect(),
            usage_days: 7,
        }
    }
}

pub struct SlashExecutor<'a> {
    ledger: Ledger,
    journal: Journal,
    rate_limiter: RateLimiter,
    locks: LockManager,
    backoff: BackoffStore,
    budget: AdvisoryBudget,
    pipeline_log: PipelineLog,
    advisory: &'a dyn AdvisoryClient,
    poster: Option<&'a dyn CommentPoster>,
    settings: SlashSettings,
}

impl<'a> SlashExecutor<'a> {
    pub fn new(
        storage: &Storage,
        config: &Config,
        pipeline_log: PipelineLog,
        advisory: &'a dyn AdvisoryClient,
        settings: SlashSettings,
    ) -> Self {
        Self {
            ledger: storage.ledger(),
            journal: storage.journal(),
            rate_limiter: storage.rate_limiter(Duration::from_secs(config.slash.rate_limit_secs)),
            locks: storage.locks(),
            backoff: storage.backoff(Duration::from_secs(config.backoff.lock_timeout_secs)),
            budget: storage.budget(config.advisory.limits()),
            pipeline_log,
            advisory,
            poster: None,
            settings,
        }
    }

    /// Replies are also posted as PR comments through `poster`.
    #[must_use]
    pub fn with_poster(mut self, poster: &'a dyn CommentPoster) -> Self {
        self.poster = Some(poster);
        self
    }

    /// Runs one request end to end. Never fails; the outcome carries the exit code.
    pub fn execute(&self, request: &SlashRequest<'_>, ctx: &Context, now: Timestamp) -> SlashOutcome {
        let outcome = self.run(request, ctx, now);
        info!(
            command = request.command,
            user = request.user,
            outcome = outcome.status.label(),
            "slash command handled"
        );
        self.audit(request, &outcome, now);
        self.reply(request, &outcome);
        outcome
    }

    fn run(&self, request: &SlashRequest<'_>, ctx: &Context, now: Timestamp) -> SlashOutcome {
        if let Err(e) = validate_name(request.command) {
            return SlashOutcome::invalid(e);
        }
        let Some(spec) = COMMANDS.iter().find(|c| c.name == request.command) else {
            return SlashOutcome::invalid(ValidationError::UnknownCommand(request.command.to_string()));
        };
        let arg = match validate_arg(spec.name, spec.arg, request.args) {
            Ok(arg) => arg,
            Err(e) => return SlashOutcome::invalid(e),
        };

        if let RateDecision::Limited { retry_after_secs } =
            self.rate_limiter.check_and_record(request.user, now)
        {
            return SlashOutcome::new(
                SlashStatus::RateLimited { retry_after_secs },
                format!("rate limited: retry after {retry_after_secs} seconds"),
            );
        }

        let key = IdempotencyKey::for_slash(
            spec.name,
            arg.as_deref().unwrap_or_default(),
            request.user,
            now,
            self.settings.dedup_bucket_secs,
        );
        if !self.ledger.should_process(&key, now) {
            return SlashOutcome::new(SlashStatus::Duplicate, "already handled");
        }

        let guard = if spec.mutating {
            match self.locks.acquire(COMMAND_MUTATION, self.settings.lock_timeout) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    // The call never ran: it shouldn't cost the user a window.
                    self.release_claim(&key);
                    self.rate_limiter.forget(request.user, now);
                    let status = if matches!(e, LockError::Timeout { .. }) {
                        SlashStatus::LockTimeout
                    } else {
                        SlashStatus::Failed
                    };
                    return SlashOutcome::new(status, format!("{e}; try again shortly"));
                }
            }
        } else {
            None
        };

        let result = self.dispatch(spec, arg.as_deref(), request, ctx, now);
        if let Some(guard) = guard {
            guard.release();
        }

        match result {
            Ok(message) => {
                if let Err(e) = self.ledger.mark_complete(&key, now) {
                    warn!(%key, error = %e, "could not mark slash command complete");
                }
                SlashOutcome::new(SlashStatus::Completed, message)
            }
            Err(message) => {
                self.release_claim(&key);
                SlashOutcome::new(SlashStatus::Failed, message)
            }
        }
    }

    fn dispatch(
        &self,
        spec: &CommandSpec,
        arg: Option<&str>,
        request: &SlashRequest<'_>,
        ctx: &Context,
        now: Timestamp,
    ) -> Result<String, String> {
        debug!(command = spec.name, ?arg, "running slash command");
        match (spec.name, arg) {
            ("ci-help", _) => Ok(help()),
            ("ci-status" | "ci-pr-status", _) => Ok(self.status_summary(ctx)),
            ("ci-usage", user) => self.usage(user, now),
            ("ci-retry-job", Some(job)) => self.retry_job(job, request.user, ctx, now),
            ("ci-reset-phase", Some(id)) => self.reset_phase(id, now),
            ("ci-clear-cache", _) => self.clear_cache(request.user, ctx, now),
            ("ci-clear-backoff", _) => self.clear_backoff(request.user, ctx, now),
            ("ci-review", Some(service)) => self.review(service, request.user, ctx, now),
            (name, _) => Err(format!("{name} is missing its argument")),
        }
    }

    // ── Command bodies ──

    fn status_summary(&self, ctx: &Context) -> String {
        let mut out = String::new();
        let phase = match self.pipeline_log.current_phase() {
            Ok(phase) => phase.or_else(|| ctx.phase.clone()),
            Err(e) => {
                warn!(error = %e, "could not read pipeline log");
                ctx.phase.clone()
            }
        };
        match phase {
            Some(p) => {
                let _ = writeln!(
                    out,
                    "Phase: {} ({}) {}, {:.0}% done",
                    p.id,
                    p.name,
                    p.status,
                    p.progress * 100.0
                );
            }
            None => out.push_str("Phase: unknown\n"),
        }

        let short = short_sha(&ctx.commit_sha);
        let failures = self.backoff.get(&Subject::commit(&ctx.commit_sha));
        let ceiling = self.settings.commit_ceiling;
        let _ = write!(out, "Commit {short}: {failures}/{ceiling} failures");
        if failures >= ceiling {
            out.push_str(" (retries halted; push a new commit)");
        }
        out.push('\n');

        match self.locks.holder(COMMAND_MUTATION) {
            Some(holder) => {
                let _ = writeln!(
                    out,
                    "Command lock: held by pid {} since {}",
                    holder.pid, holder.acquired_at
                );
            }
            None => out.push_str("Command lock: free\n"),
        }

        let counters = self.backoff.command_counters();
        if !counters.is_empty() {
            out.push_str("Failing commands:\n");
            for (signature, record) in counters.iter().take(5) {
                let _ = writeln!(out, "  {signature}: {}", record.count);
            }
        }
        out
    }

    fn usage(&self, user: Option<&str>, now: Timestamp) -> Result<String, String> {
        let days = self.settings.usage_days;
        let summaries = self
            .budget
            .summary(days, user, now)
            .map_err(|e| format!("could not read advisory usage: {e}"))?;

        let mut out = String::new();
        match user {
            Some(user) => {
                let _ = writeln!(out, "Advisory usage for {user}, last {days} days:");
            }
            None => {
                let _ = writeln!(out, "Advisory usage, last {days} days:");
            }
        }
        if summaries.is_empty() {
            out.push_str("  no requests\n");
        }
        for s in &summaries {
            let _ = writeln!(
                out,
                "  {}: {} request(s), ${:.2}",
                s.service, s.requests, s.cost_usd
            );
        }
        let limits = self.budget.limits();
        let _ = writeln!(
            out,
            "Limits: {}/day, {}/hour per service",
            limits.max_requests_per_day, limits.max_requests_per_hour
        );
        Ok(out)
    }

    fn retry_job(&self, job: &str, user: &str, ctx: &Context, now: Timestamp) -> Result<String, String> {
        let commit = Subject::commit(&ctx.commit_sha);
        match self.backoff.check_limit(&commit, self.settings.commit_ceiling) {
            Ok(Limit::Blocked { count }) => return Err(halt_text(&ctx.commit_sha, count)),
            Ok(Limit::Allowed { .. }) => {}
            Err(e) => return Err(format!("could not read failure counters: {e}")),
        }

        self.backoff
            .reset(&Subject::command(job))
            .map_err(|e| format!("could not reset {job}: {e}"))?;
        let details = json!({ "job": job, "user": user, "commit_sha": ctx.commit_sha });
        self.pipeline_log
            .append("retry-requested", details, now)
            .map_err(|e| format!("could not record retry request: {e}"))?;
        Ok(format!("Retry requested for job {job}"))
    }

    fn reset_phase(&self, id: &str, now: Timestamp) -> Result<String, String> {
        let phase = self
            .pipeline_log
            .reset_phase(id, now)
            .map_err(|e| format!("could not reset {id}: {e}"))?;
        Ok(format!("Phase {} ({}) reset to {}", phase.id, phase.name, phase.status))
    }

    fn clear_cache(&self, user: &str, ctx: &Context, now: Timestamp) -> Result<String, String> {
        let mut cleared = Vec::new();
        for dir in &self.settings.cache_dirs {
            if !is_inside(&ctx.repo_root, dir) {
                warn!(dir = %dir.display(), "refusing to clear cache outside the repository");
                continue;
            }
            match fs::remove_dir_all(dir) {
                Ok(()) => cleared.push(dir.display().to_string()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(format!("could not clear {}: {e}", dir.display())),
            }
        }

        let details = json!({ "user": user, "cleared": cleared });
        if let Err(e) = self.pipeline_log.append("cache-cleared", details, now) {
            warn!(error = %e, "could not record cache clear");
        }
        Ok(format!("Cleared {} cache director(ies)", cleared.len()))
    }

    fn clear_backoff(&self, user: &str, ctx: &Context, now: Timestamp) -> Result<String, String> {
        self.backoff
            .reset(&Subject::commit(&ctx.commit_sha))
            .map_err(|e| format!("could not clear failure counter: {e}"))?;
        let details = json!({ "user": user, "commit_sha": ctx.commit_sha });
        if let Err(e) = self.pipeline_log.append("backoff-cleared", details, now) {
            warn!(error = %e, "could not record backoff clear");
        }
        Ok(format!(
            "Cleared the failure counter for commit {}",
            short_sha(&ctx.commit_sha)
        ))
    }

    fn review(&self, service: &str, user: &str, ctx: &Context, now: Timestamp) -> Result<String, String> {
        let request = AdvisoryRequest {
            service: service.to_string(),
            reason: "review requested via ci-review".to_string(),
            requested_at: now,
            requested_by: Some(user.to_string()),
            command: None,
            error_excerpt: None,
            failure_count: self.backoff.get(&Subject::commit(&ctx.commit_sha)),
            commit_sha: ctx.commit_sha.clone(),
            session_id: ctx.session_id.clone(),
        };
        self.advisory
            .request(&request)
            .map_err(|e| format!("review not requested: {e}"))?;
        Ok(format!("Requested a {service} review"))
    }

    // ── Bookkeeping ──

    fn release_claim(&self, key: &IdempotencyKey) {
        if let Err(e) = self.ledger.forget(key) {
            warn!(%key, error = %e, "could not release slash command claim");
        }
    }

    fn audit(&self, request: &SlashRequest<'_>, outcome: &SlashOutcome, now: Timestamp) {
        let mut record = AuditRecord::new(now, "slash-command", request.command, outcome.status.label())
            .field("args", request.args)
            .field("user", request.user)
            .field("message", outcome.message.clone());
        if let Some(pr) = request.pr_number {
            record = record.field("pr", pr.to_string());
        }
        if let Err(e) = self.journal.append_audit(&record) {
            warn!(error = %e, "could not write audit record");
        }
    }

    fn reply(&self, request: &SlashRequest<'_>, outcome: &SlashOutcome) {
        let Some(poster) = self.poster else {
            return;
        };
        let Some(pr) = reply_target(request, outcome) else {
            return;
        };
        let body = format!(
            "`/{}` {}\n\n{}",
            request.command,
            outcome.status.label(),
            outcome.message.trim_end()
        );
        if let Err(e) = poster.post(pr, &body) {
            warn!(pr, error = %e, "could not post reply");
        }
    }
}

/// `ci-pr-status` replies on the PR it names; everything else on the PR it
/// was issued from.
fn reply_target(request: &SlashRequest<'_>, outcome: &SlashOutcome) -> Option<u64> {
    if request.command == "ci-pr-status" && outcome.status == SlashStatus::Completed {
        request.args.trim().parse().ok().or(request.pr_number)
    } else {
        request.pr_number
    }
}

fn help() -> String {
    let mut out = String::from("Available commands:\n");
    for c in COMMANDS {
        let hint = c.arg.hint();
        let sep = if hint.is_empty() { "" } else { " " };
        let _ = writeln!(out, "  /{}{sep}{hint}: {}", c.name, c.summary);
    }
    out
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

/// Whether `path` is strictly below `root` without climbing out through `..`.
fn is_inside(root: &Path, path: &Path) -> bool {
    path != root
        && path.starts_with(root)
        && !path.components().any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::{
        advisory::tests::RecordingAdvisory, github::tests::RecordingPoster, model::PipelinePhase,
    };

    struct Fixture {
        dir: TempDir,
        storage: Storage,
        config: Config,
        ctx: Context,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let storage = Storage::new(dir.path().join("state"))
                .unwrap()
                .with_lock_retry(Duration::from_millis(10));
            let mut config = Config::default();
            config.lock.timeout_secs = 0;
            let ctx = Context::new(dir.path().to_path_buf()).with_commit("0123456789abcdef");
            Self {
                dir,
                storage,
                config,
                ctx,
            }
        }

        fn pipeline_log(&self) -> PipelineLog {
            PipelineLog::new(self.dir.path().join("pipeline-log.json"), self.storage.locks())
        }

        fn executor<'a>(&self, advisory: &'a dyn AdvisoryClient) -> SlashExecutor<'a> {
            SlashExecutor::new(
                &self.storage,
                &self.config,
                self.pipeline_log(),
                advisory,
                SlashSettings::from_config(&self.config, self.dir.path()),
            )
        }
    }

    fn request<'a>(command: &'a str, args: &'a str, user: &'a str) -> SlashRequest<'a> {
        SlashRequest {
            command,
            args,
            user,
            pr_number: None,
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    #[test]
    fn help_lists_every_command() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();

        let outcome = fx
            .executor(&advisory)
            .execute(&request("ci-help", "", "alice"), &fx.ctx, ts(0));

        assert_eq!(outcome.exit_code(), 0);
        for c in COMMANDS {
            assert!(outcome.message.contains(c.name), "{}", c.name);
        }
        assert!(outcome.message.contains("/ci-reset-phase <phase-N>"));
    }

    #[test]
    fn invalid_argument_changes_nothing_and_is_audited() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();
        let executor = fx.executor(&advisory);

        let outcome = executor.execute(&request("ci-reset-phase", "phase3", "alice"), &fx.ctx, ts(0));

        assert_eq!(outcome.exit_code(), 1);
        assert!(matches!(outcome.status, SlashStatus::Invalid(_)));
        assert!(outcome.message.contains("phase id"));
        assert!(fx.pipeline_log().current_phase().unwrap().is_none());

        let audit = fx.storage.journal().read_audit().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, "invalid");
        assert_eq!(audit[0].fields["args"], "phase3");
    }

    #[test]
    fn bad_and_unknown_names() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();
        let executor = fx.executor(&advisory);

        let bad = executor.execute(&request("ci status", "", "alice"), &fx.ctx, ts(0));
        let unknown = executor.execute(&request("ci-deploy", "", "alice"), &fx.ctx, ts(0));

        assert!(matches!(bad.status, SlashStatus::Invalid(ValidationError::InvalidName(_))));
        assert!(matches!(
            unknown.status,
            SlashStatus::Invalid(ValidationError::UnknownCommand(_))
        ));
    }

    #[test]
    fn second_call_within_window_is_rate_limited() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();
        let executor = fx.executor(&advisory);

        let first = executor.execute(&request("ci-status", "", "alice"), &fx.ctx, ts(0));
        let second = executor.execute(&request("ci-status", "", "alice"), &fx.ctx, ts(10));
        let later = executor.execute(&request("ci-status", "", "alice"), &fx.ctx, ts(31));

        assert_eq!(first.status, SlashStatus::Completed);
        assert_eq!(second.status, SlashStatus::RateLimited { retry_after_secs: 20 });
        assert_eq!(second.exit_code(), EXIT_RATE_LIMITED);
        assert!(second.message.contains("retry after 20 seconds"));
        assert_eq!(later.status, SlashStatus::Completed);
    }

    #[test]
    fn duplicate_delivery_is_skipped_when_rate_limit_is_unavailable() {
        let fx = Fixture::new();
        // Rate limiting fails open when its directory can't be created.
        fs::write(fx.storage.root().join("ratelimit"), "blocker").unwrap();
        let advisory = RecordingAdvisory::default();
        let executor = fx.executor(&advisory);

        let first = executor.execute(&request("ci-review", "o3", "alice"), &fx.ctx, ts(0));
        let again = executor.execute(&request("ci-review", "o3", "alice"), &fx.ctx, ts(2));

        assert_eq!(first.status, SlashStatus::Completed);
        assert_eq!(again.status, SlashStatus::Duplicate);
        assert_eq!(again.exit_code(), 0);
        assert_eq!(advisory.requests.borrow().len(), 1);
    }

    #[test]
    fn mutating_command_times_out_on_held_lock() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();
        let executor = fx.executor(&advisory);
        let held = fx
            .storage
            .locks()
            .acquire(COMMAND_MUTATION, Duration::ZERO)
            .unwrap();

        let blocked = executor.execute(&request("ci-clear-backoff", "", "alice"), &fx.ctx, ts(0));
        let read_only = executor.execute(&request("ci-status", "", "bob"), &fx.ctx, ts(0));

        assert_eq!(blocked.status, SlashStatus::LockTimeout);
        assert_eq!(blocked.exit_code(), EXIT_LOCK_TIMEOUT);
        assert_eq!(read_only.status, SlashStatus::Completed);
        assert!(read_only.message.contains("Command lock: held by pid"));

        held.release();
        let audit = fx.storage.journal().read_audit().unwrap();
        assert_eq!(audit[0].outcome, "lock-timeout");

        let retried = executor.execute(&request("ci-clear-backoff", "", "alice"), &fx.ctx, ts(1));
        assert_eq!(retried.status, SlashStatus::Completed);
    }

    #[test]
    fn retry_job_refused_for_blocked_commit() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();
        let executor = fx.executor(&advisory);
        let backoff = fx.storage.backoff(Duration::from_secs(1));
        for i in 0..3 {
            backoff.increment(&Subject::commit("0123456789abcdef"), ts(i)).unwrap();
        }

        let outcome = executor.execute(&request("ci-retry-job", "build-m68k", "alice"), &fx.ctx, ts(10));

        assert_eq!(outcome.status, SlashStatus::Failed);
        assert!(outcome.message.contains("Push a new commit"));
    }

    #[test]
    fn retry_job_resets_counter_and_logs() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();
        let executor = fx.executor(&advisory);
        let backoff = fx.storage.backoff(Duration::from_secs(1));
        backoff.increment(&Subject::command("build-m68k"), ts(0)).unwrap();

        let outcome = executor.execute(&request("ci-retry-job", "build-m68k", "alice"), &fx.ctx, ts(10));

        assert_eq!(outcome.status, SlashStatus::Completed);
        assert_eq!(backoff.get(&Subject::command("build-m68k")), 0);
        let doc = fx.pipeline_log().load().unwrap();
        assert_eq!(doc.activities[0].kind, "retry-requested");
    }

    #[test]
    fn reset_phase_sets_pending() {
        let fx = Fixture::new();
        fx.pipeline_log()
            .set_phase(PipelinePhase::new("phase-3", "Package", "failed"), ts(0))
            .unwrap();
        let advisory = RecordingAdvisory::default();

        let outcome = fx
            .executor(&advisory)
            .execute(&request("ci-reset-phase", "phase-3", "alice"), &fx.ctx, ts(5));

        assert_eq!(outcome.status, SlashStatus::Completed);
        let phase = fx.pipeline_log().current_phase().unwrap().unwrap();
        assert_eq!(phase.status, "pending");
        assert_eq!(phase.name, "Package");
    }

    #[test]
    fn clear_cache_removes_directories_inside_repo_only() {
        let mut fx = Fixture::new();
        let cache = fx.dir.path().join(".cache").join("ci");
        fs::create_dir_all(cache.join("objects")).unwrap();
        let outside = TempDir::new().unwrap();
        fx.config.paths.cache_dirs = vec![PathBuf::from(".cache/ci"), outside.path().to_path_buf()];
        let advisory = RecordingAdvisory::default();

        let outcome = fx
            .executor(&advisory)
            .execute(&request("ci-clear-cache", "", "alice"), &fx.ctx, ts(0));

        assert_eq!(outcome.status, SlashStatus::Completed);
        assert!(!cache.exists());
        assert!(outside.path().exists());
        assert!(outcome.message.contains("Cleared 1"));
    }

    #[test]
    fn clear_backoff_resets_commit() {
        let fx = Fixture::new();
        let backoff = fx.storage.backoff(Duration::from_secs(1));
        backoff.increment(&Subject::commit("0123456789abcdef"), ts(0)).unwrap();
        let advisory = RecordingAdvisory::default();

        fx.executor(&advisory)
            .execute(&request("ci-clear-backoff", "", "alice"), &fx.ctx, ts(1));

        assert_eq!(backoff.get(&Subject::commit("0123456789abcdef")), 0);
    }

    #[test]
    fn review_goes_to_advisory() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();

        let outcome = fx
            .executor(&advisory)
            .execute(&request("ci-review", "gemini", "alice"), &fx.ctx, ts(0));

        assert_eq!(outcome.status, SlashStatus::Completed);
        let sent = advisory.requests.borrow();
        assert_eq!(sent[0].service, "gemini");
        assert_eq!(sent[0].requested_by.as_deref(), Some("alice"));
    }

    #[test]
    fn failed_review_reports_and_can_be_retried() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory {
            fail: true,
            ..RecordingAdvisory::default()
        };
        let executor = fx.executor(&advisory);

        let outcome = executor.execute(&request("ci-review", "o3", "alice"), &fx.ctx, ts(0));

        assert_eq!(outcome.status, SlashStatus::Failed);
        assert_eq!(outcome.exit_code(), 1);
        assert!(outcome.message.starts_with("review not requested"));
    }

    #[test]
    fn usage_reports_recorded_requests() {
        let fx = Fixture::new();
        fx.storage
            .budget(fx.config.advisory.limits())
            .record("gemini", Some("alice"), ts(0))
            .unwrap();
        let advisory = RecordingAdvisory::default();

        let outcome = fx
            .executor(&advisory)
            .execute(&request("ci-usage", "alice", "bob"), &fx.ctx, ts(60));

        assert!(outcome.message.contains("gemini: 1 request(s)"));
        assert!(outcome.message.contains("Limits: 10/day, 3/hour"));
    }

    #[test]
    fn pr_status_posts_to_named_pr() {
        let fx = Fixture::new();
        let advisory = RecordingAdvisory::default();
        let poster = RecordingPoster::default();
        let executor = fx.executor(&advisory).with_poster(&poster);
        let req = SlashRequest {
            pr_number: Some(7),
            ..request("ci-pr-status", "42", "alice")
        };

        executor.execute(&req, &fx.ctx, ts(0));
        executor.execute(&request("ci-help", "", "bob"), &fx.ctx, ts(0));

        let comments = poster.comments.borrow();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].0, 42);
        assert!(comments[0].1.contains("Commit 0123456789ab: 0/3 failures"));
    }

    #[test]
    fn path_containment() {
        let root = Path::new("/repo");
        assert!(is_inside(root, Path::new("/repo/.cache/ci")));
        assert!(!is_inside(root, Path::new("/repo")));
        assert!(!is_inside(root, Path::new("/repo/../etc")));
        assert!(!is_inside(root, Path::new("/tmp/cache")));
    }
}
