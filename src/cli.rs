//! CLI interface for hookline.
//!
//! Called by CI hooks and by humans alike. Each subcommand is non-interactive:
//! arguments (and, for events, a JSON payload on stdin) in, an exit code out.
//!
//! Commands split into two groups:
//!
//! - `hookline event|slash`: the hook entry points. Their exit codes are part
//!   of the contract with the calling tool.
//! - everything else: inspection and maintenance of the shared state.
//!
//! The `--repo` flag points at the checkout; it defaults to the current directory.

mod format;
mod hook;
mod state;

use std::{env, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use crate::{
    advisory::{Budgeted, CommandAdvisory},
    config::Config,
    context::Context,
    known_issue::KnownIssueCatalog,
    storage::{BackoffStore, PipelineLog, Storage},
};

use hook::{cmd_event, cmd_known_issue, cmd_slash};
use state::{
    BackoffCommand, BudgetCommand, PhaseCommand, StatusCommand, cmd_audit, cmd_backoff,
    cmd_budget, cmd_phase, cmd_purge, cmd_status,
};

/// Hookline: CI hook dispatch with dedup, backoff and escalation.
#[derive(Debug, Parser)]
#[command(name = "hookline", after_long_help = HOOK_HELP)]
pub struct Cli {
    /// Repository checkout root. Defaults to the current directory.
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

const HOOK_HELP: &str = r#"Hook wiring:
  pre-tool-use        hookline event pre-tool-use        (exit 2 blocks the tool)
  post-tool-use       hookline event post-tool-use
  user-prompt-submit  hookline event user-prompt-submit  (exit 2 blocks the prompt)
  stop                hookline event stop

Slash commands from PR comments:
  hookline slash ci-retry-job build-m68040 --user octocat --pr 42
  hookline slash ci-help

Exit codes:
  0 done, skipped or ignored   1 failed   2 blocked
  69 rate limited   75 lock timeout (retry)"#;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Dispatch one hook event.
    ///
    /// The JSON payload is read from `--payload` or stdin. Malformed input is
    /// logged and ignored; only a gate rejection exits non-zero.
    Event {
        /// Event kind, e.g. `pre-tool-use` or `post-tool-use`.
        kind: String,

        /// Payload JSON. Read from stdin when omitted.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Execute a slash command.
    Slash {
        /// Command name, e.g. `ci-status`.
        command: String,

        /// The command's argument, if it takes one.
        #[arg(default_value = "")]
        args: String,

        /// Who issued the command. Defaults to `$GITHUB_ACTOR`.
        #[arg(long)]
        user: Option<String>,

        /// Pull request to reply on.
        #[arg(long)]
        pr: Option<u64>,
    },

    /// Classify error text against the known-issue catalog.
    ///
    /// Prints the matching entry as JSON, or exits 1 when nothing matches.
    KnownIssue {
        /// Error text, or `-` to read stdin.
        text: String,

        #[arg(long)]
        phase: Option<String>,

        #[arg(long)]
        cpu_variant: Option<String>,
    },

    /// Inspect or reset failure counters.
    Backoff {
        #[command(subcommand)]
        command: BackoffCommand,
    },

    /// Read or set the current pipeline phase.
    Phase {
        #[command(subcommand)]
        command: PhaseCommand,
    },

    /// Append to or rotate the pipeline log.
    Status {
        #[command(subcommand)]
        command: StatusCommand,
    },

    /// Drop stale idempotency records and failure counters.
    Purge,

    /// Advisory request budget.
    Budget {
        #[command(subcommand)]
        command: BudgetCommand,
    },

    /// Show the most recent audit entries: security rejections and slash commands.
    Audit {
        /// How many entries to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Everything a command needs, built once per invocation.
struct Runtime {
    config: Config,
    storage: Storage,
    pipeline_log: PipelineLog,
    ctx: Context,
}

impl Runtime {
    /// With `fail_open`, an unusable state directory degrades storage instead
    /// of failing: the gates must still run for hook events.
    fn load(repo: Option<PathBuf>, fail_open: bool) -> Result<Self, String> {
        let repo_root = match repo {
            Some(path) => path,
            None => env::current_dir().map_err(|e| format!("failed to read current directory: {e}"))?,
        };
        let config = Config::load(&repo_root).map_err(|e| e.to_string())?;

        let state_dir = Config::resolve(&repo_root, &config.paths.state_dir);
        let storage = match Storage::new(&state_dir) {
            Ok(storage) => storage,
            Err(e) if fail_open => {
                warn!(state = %state_dir.display(), error = %e, "state directory unusable, continuing without it");
                Storage::unchecked(state_dir)
            }
            Err(e) => return Err(format!("failed to initialize storage: {e}")),
        }
        .with_lock_retry(config.lock.retry_interval());
        debug!(state = %storage.root().display(), "storage ready");
        let pipeline_log = PipelineLog::new(
            Config::resolve(&repo_root, &config.paths.pipeline_log),
            storage.locks(),
        );

        let phase = pipeline_log.current_phase().unwrap_or_else(|e| {
            warn!(error = %e, "could not read current phase");
            None
        });
        let ctx = Context::from_env(repo_root).with_phase(phase);

        Ok(Self {
            config,
            storage,
            pipeline_log,
            ctx,
        })
    }

    fn backoff(&self) -> BackoffStore {
        self.storage
            .backoff(Duration::from_secs(self.config.backoff.lock_timeout_secs))
    }

    fn catalog_path(&self) -> PathBuf {
        Config::resolve(&self.ctx.repo_root, &self.config.paths.known_issues)
    }

    /// The catalog, or an empty one when it can't be loaded. A broken catalog
    /// must not take the hook down with it.
    fn catalog(&self) -> KnownIssueCatalog {
        match KnownIssueCatalog::load(&self.catalog_path()) {
            Ok(catalog) if catalog.is_empty() => {
                debug!("known-issue catalog is empty");
                catalog
            }
            Ok(catalog) => {
                debug!(entries = catalog.len(), "known-issue catalog loaded");
                catalog
            }
            Err(e) => {
                warn!(error = %e, "known-issue catalog unavailable");
                KnownIssueCatalog::default()
            }
        }
    }

    fn advisory(&self) -> Budgeted<CommandAdvisory> {
        let client = CommandAdvisory::new(
            self.config.advisory.command.clone(),
            self.ctx.repo_root.clone(),
        );
        Budgeted::new(
            client,
            self.storage.budget(self.config.advisory.limits()),
            self.storage.locks(),
            self.config.lock.timeout(),
        )
    }
}

/// Run the CLI, returning the process exit code or an error message.
pub fn run() -> Result<u8, String> {
    let cli = Cli::parse();
    let fail_open = matches!(cli.command, Command::Event { .. });
    let rt = Runtime::load(cli.repo, fail_open)?;

    match cli.command {
        Command::Event { kind, payload } => cmd_event(&rt, &kind, payload),
        Command::Slash {
            command,
            args,
            user,
            pr,
        } => {
            let user = user
                .or_else(|| env::var("GITHUB_ACTOR").ok().filter(|u| !u.is_empty()))
                .unwrap_or_else(|| "unknown".to_string());
            cmd_slash(&rt, &command, &args, &user, pr)
        }
        Command::KnownIssue {
            text,
            phase,
            cpu_variant,
        } => cmd_known_issue(&rt, &text, phase.as_deref(), cpu_variant.as_deref()),
        Command::Backoff { command } => cmd_backoff(&rt, command).map(|()| 0),
        Command::Phase { command } => cmd_phase(&rt, command).map(|()| 0),
        Command::Status { command } => cmd_status(&rt, command).map(|()| 0),
        Command::Purge => cmd_purge(&rt).map(|()| 0),
        Command::Budget { command } => cmd_budget(&rt, command).map(|()| 0),
        Command::Audit { limit } => cmd_audit(&rt, limit).map(|()| 0),
    }
}
