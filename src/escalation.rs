//! Escalation policy: what to do after a command fails.
//!
//! Two counters are kept per failure. The per-command counter says "this exact
//! command keeps failing" and drives advisory escalation; the per-commit
//! counter says "this commit looks unfixable" and drives the halt signal.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use jiff::Timestamp;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    advisory::{AdvisoryClient, AdvisoryError, AdvisoryRequest},
    context::Context,
    diagnostics::{self, DiagnosticSnapshot},
    known_issue::{KnownIssueCatalog, MatchContext},
    model::{EscalationDecision, KnownIssue, Remedy},
    process::{self, ProcessSpec},
    storage::{BackoffStore, Limit, Subject},
};

/// Failure shapes that suggest a problem worth a second opinion.
pub const DEFAULT_COMPLEX_PATTERNS: &[&str] = &[
    r"undefined reference to",
    r"LLVM ERROR",
    r"internal compiler error",
    r"error\[E\d{4}\]",
    r"linker .* failed",
    r"(?i)segmentation fault",
    r"thread '.*' panicked",
    r"could not compile",
];

/// Tunables for [`EscalationPolicy`].
#[derive(Debug, Clone)]
pub struct EscalationSettings {
    /// Escalate only when the command has failed more than this many times.
    pub command_threshold: u32,

    /// Commit-level failure ceiling.
    pub commit_ceiling: u32,

    /// Errors longer than this many characters are escalation-worthy on length alone.
    pub min_error_len: usize,

    pub complex_patterns: Vec<Regex>,

    /// Advisory service named in requests.
    pub service: String,

    /// Where diagnostic snapshots go; `None` disables them.
    pub snapshots_dir: Option<PathBuf>,
}

impl EscalationSettings {
    /// Compiles `patterns`, failing on the first invalid one.
    pub fn with_patterns(patterns: &[impl AsRef<str>]) -> Result<Self, regex::Error> {
        let complex_patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            complex_patterns,
            ..Self::default()
        })
    }

    fn is_escalation_worthy(&self, error_text: &str) -> bool {
        error_text.chars().count() > self.min_error_len
            || self.complex_patterns.iter().any(|re| re.is_match(error_text))
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            command_threshold: 2,
            commit_ceiling: 3,
            min_error_len: 500,
            complex_patterns: DEFAULT_COMPLEX_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            service: "gemini".to_string(),
            snapshots_dir: None,
        }
    }
}

/// One observed command failure.
#[derive(Debug, Clone, Copy)]
pub struct Failure<'a> {
    pub command: &'a str,
    pub error_text: &'a str,
    pub exit_code: Option<i32>,
}

/// Runs a known issue's remedy.
pub trait AutoFixRunner {
    fn run(&self, issue: &KnownIssue, ctx: &Context) -> Result<(), String>;
}

/// Runs `auto_fix` as an executable relative to the repository root.
#[derive(Debug, Clone)]
pub struct ScriptFixer {
    timeout: Duration,
}

impl ScriptFixer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AutoFixRunner for ScriptFixer {
    fn run(&self, issue: &KnownIssue, ctx: &Context) -> Result<(), String> {
        let Some(script) = &issue.auto_fix else {
            return Err(format!("known issue {} has no auto-fix", issue.id));
        };
        let path = resolve(&ctx.repo_root, script);
        let argv = vec![path.to_string_lossy().into_owned()];
        let spec = ProcessSpec::new(&argv)
            .cwd(&ctx.repo_root)
            .env("HOOKLINE_ISSUE_ID", issue.id.clone())
            .env("HOOKLINE_COMMIT_SHA", ctx.commit_sha.clone());

        let output = process::run_with_timeout(&spec, self.timeout).map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(format!(
                "exited with {}: {}",
                output.code(),
                output.stderr.trim()
            ))
        }
    }
}

fn resolve(root: &Path, script: &str) -> PathBuf {
    let path = Path::new(script);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Decides the remediation path for failed commands.
pub struct EscalationPolicy<'a> {
    backoff: &'a BackoffStore,
    catalog: &'a KnownIssueCatalog,
    fixer: &'a dyn AutoFixRunner,
    advisory: &'a dyn AdvisoryClient,
    settings: EscalationSettings,
    environment: Vec<(String, String)>,
}

impl<'a> EscalationPolicy<'a> {
    pub fn new(
        backoff: &'a BackoffStore,
        catalog: &'a KnownIssueCatalog,
        fixer: &'a dyn AutoFixRunner,
        advisory: &'a dyn AdvisoryClient,
        settings: EscalationSettings,
    ) -> Self {
        Self {
            backoff,
            catalog,
            fixer,
            advisory,
            settings,
            environment: Vec::new(),
        }
    }

    /// Environment recorded in diagnostic snapshots.
    #[must_use]
    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = environment;
        self
    }

    /// Handles one failed command.
    pub fn on_failure(&self, failure: Failure<'_>, ctx: &Context, now: Timestamp) -> EscalationDecision {
        let command = Subject::command(failure.command);
        let commit = Subject::commit(&ctx.commit_sha);

        // Counters first, whatever happens next.
        let command_failures = self.bump(&command, now);
        let commit_failures = self.bump(&commit, now);

        let remedy = self.remediate(failure, ctx, command_failures, now);
        let halt = self.halt_message(&commit, &ctx.commit_sha);

        let decision = EscalationDecision {
            remedy,
            command_failures,
            commit_failures,
            halt,
        };
        info!(command = %command, %decision, "failure handled");
        decision
    }

    /// A success resets the counter for that command only.
    pub fn on_success(&self, command: &str) {
        if let Err(e) = self.backoff.reset(&Subject::command(command)) {
            warn!(error = %e, "could not reset command counter");
        }
    }

    fn remediate(
        &self,
        failure: Failure<'_>,
        ctx: &Context,
        command_failures: u32,
        now: Timestamp,
    ) -> Remedy {
        let match_ctx = MatchContext {
            phase: ctx.phase_id(),
            cpu_variant: ctx.cpu_variant.as_deref(),
        };
        let known = self.catalog.find(failure.error_text, match_ctx);

        if diagnostics::is_file_related(failure.error_text) {
            self.snapshot(failure.error_text, ctx, now);
        }

        if let Some(issue) = known
            && issue.auto_fix.is_some()
        {
            return match self.fixer.run(issue, ctx) {
                Ok(()) => {
                    info!(issue = %issue.id, "auto-fix succeeded");
                    Remedy::AutoFixed {
                        issue_id: issue.id.clone(),
                    }
                }
                Err(error) => {
                    warn!(issue = %issue.id, %error, "auto-fix failed");
                    Remedy::AutoFixFailed {
                        issue_id: issue.id.clone(),
                        error,
                    }
                }
            };
        }

        if let Some(issue) = known {
            return Remedy::KnownIssue {
                issue_id: issue.id.clone(),
            };
        }

        if command_failures > self.settings.command_threshold
            && self.settings.is_escalation_worthy(failure.error_text)
        {
            return self.escalate(failure, ctx, command_failures, now);
        }

        debug!(command_failures, "failure left unclassified");
        Remedy::Unclassified
    }

    fn escalate(
        &self,
        failure: Failure<'_>,
        ctx: &Context,
        command_failures: u32,
        now: Timestamp,
    ) -> Remedy {
        let request = AdvisoryRequest {
            service: self.settings.service.clone(),
            reason: match failure.exit_code {
                Some(code) => format!("command failed {command_failures} times, last exit code {code}"),
                None => format!("command failed {command_failures} times"),
            },
            requested_at: now,
            requested_by: None,
            command: Some(failure.command.to_string()),
            error_excerpt: Some(tail(failure.error_text, 4000)),
            failure_count: command_failures,
            commit_sha: ctx.commit_sha.clone(),
            session_id: ctx.session_id.clone(),
        };
        match self.advisory.request(&request) {
            Ok(()) => Remedy::Escalated,
            Err(AdvisoryError::Budget { reason, .. }) => Remedy::EscalationDeferred { reason },
            Err(e) => {
                warn!(error = %e, "advisory request failed");
                Remedy::EscalationDeferred {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn snapshot(&self, error_text: &str, ctx: &Context, now: Timestamp) {
        let Some(dir) = &self.settings.snapshots_dir else {
            return;
        };
        DiagnosticSnapshot::capture(error_text, &ctx.repo_root, self.environment.clone(), now)
            .write_to(dir);
    }

    fn bump(&self, subject: &Subject, now: Timestamp) -> u32 {
        match self.backoff.increment(subject, now) {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "could not record failure");
                self.backoff.get(subject)
            }
        }
    }

    fn halt_message(&self, commit: &Subject, sha: &str) -> Option<String> {
        match self.backoff.check_limit(commit, self.settings.commit_ceiling) {
            Ok(Limit::Blocked { count }) => {
                warn!(%commit, count, "commit reached failure ceiling");
                Some(halt_text(sha, count))
            }
            Ok(Limit::Allowed { .. }) => None,
            Err(e) => {
                warn!(error = %e, "could not check commit failure ceiling");
                None
            }
        }
    }
}

/// The actionable message for a commit that hit its ceiling.
pub fn halt_text(sha: &str, count: u32) -> String {
    let short = sha.get(..12).unwrap_or(sha);
    format!(
        "commit {short} has failed {count} times; automated retries are halted. \
         Push a new commit to continue"
    )
}

fn tail(text: &str, max: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(max);
    chars[start..].iter().collect()
}
