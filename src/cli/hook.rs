//! Hook entry points: events, slash commands and known-issue lookups.

use std::{
    env,
    io::{self, Read},
    time::Duration,
};

use jiff::Timestamp;

use crate::{
    escalation::{EscalationPolicy, EscalationSettings, ScriptFixer},
    github::GhCommentPoster,
    known_issue::{KnownIssueCatalog, MatchContext},
    model::EventKind,
    router::{Dispatcher, PhaseAlignmentGate, Registry, SecurityGate},
    slash::{SlashExecutor, SlashRequest, SlashSettings},
};

use super::{Runtime, format::format_dispatch};

pub(super) fn cmd_event(rt: &Runtime, kind: &str, payload: Option<String>) -> Result<u8, String> {
    // Bytes, not text: invalid UTF-8 is malformed input for the router to absorb.
    let raw = match payload {
        Some(raw) => raw.into_bytes(),
        None => read_stdin_bytes()?,
    };

    let mut registry = Registry::new();
    registry.register(
        EventKind::PreCommand,
        Box::new(PhaseAlignmentGate::new(rt.config.phase.blocking_statuses.clone())),
    );
    registry.register_hooks(&rt.config.hooks, &rt.ctx.repo_root);

    let security = SecurityGate::new(rt.config.security.extra_patterns.as_slice())
        .map_err(|e| format!("invalid security pattern: {e}"))?;

    let backoff = rt.backoff();
    let catalog = rt.catalog();
    let fixer = ScriptFixer::new(Duration::from_secs(rt.config.escalation.auto_fix_timeout_secs));
    let advisory = rt.advisory();
    let policy = EscalationPolicy::new(
        &backoff,
        &catalog,
        &fixer,
        &advisory,
        escalation_settings(rt)?,
    )
    .with_environment(env::vars().collect());

    let ledger = rt.storage.ledger();
    let journal = rt.storage.journal();
    let dispatcher = Dispatcher::new(&ledger, &journal, &registry, &security)
        .with_escalation(&policy)
        .with_status(&rt.pipeline_log);

    let result = dispatcher.dispatch(kind, &raw, &rt.ctx, Timestamp::now());

    // Stdout belongs to the calling tool; the verdict goes to stderr.
    eprintln!("{}", format_dispatch(&result));
    Ok(result.exit_code())
}

fn escalation_settings(rt: &Runtime) -> Result<EscalationSettings, String> {
    let config = &rt.config.escalation;
    let mut settings = match &config.complex_patterns {
        Some(patterns) => EscalationSettings::with_patterns(patterns.as_slice())
            .map_err(|e| format!("invalid escalation pattern: {e}"))?,
        None => EscalationSettings::default(),
    };
    settings.command_threshold = config.command_threshold;
    settings.commit_ceiling = rt.config.backoff.commit_ceiling;
    settings.min_error_len = config.min_error_len;
    settings.service.clone_from(&rt.config.advisory.service);
    settings.snapshots_dir = config.diagnostics.then(|| rt.storage.snapshots_dir());
    Ok(settings)
}

pub(super) fn cmd_slash(
    rt: &Runtime,
    command: &str,
    args: &str,
    user: &str,
    pr: Option<u64>,
) -> Result<u8, String> {
    let advisory = rt.advisory();
    let mut poster = GhCommentPoster::new(rt.ctx.repository.clone());
    if let Some(identity) = &rt.config.slash.identity {
        poster = poster.with_identity(identity);
    }

    let settings = SlashSettings::from_config(&rt.config, &rt.ctx.repo_root);
    let executor = SlashExecutor::new(
        &rt.storage,
        &rt.config,
        rt.pipeline_log.clone(),
        &advisory,
        settings,
    )
    .with_poster(&poster);

    let request = SlashRequest {
        command,
        args,
        user,
        pr_number: pr,
    };
    let outcome = executor.execute(&request, &rt.ctx, Timestamp::now());

    println!("{}", outcome.message.trim_end());
    Ok(outcome.exit_code())
}

pub(super) fn cmd_known_issue(
    rt: &Runtime,
    text: &str,
    phase: Option<&str>,
    cpu_variant: Option<&str>,
) -> Result<u8, String> {
    let text = if text == "-" {
        read_stdin()?
    } else {
        text.to_string()
    };

    // Explicit flags win; otherwise the invocation's own context applies.
    let ctx = MatchContext {
        phase: phase.or_else(|| rt.ctx.phase_id()),
        cpu_variant: cpu_variant.or(rt.ctx.cpu_variant.as_deref()),
    };

    let catalog = KnownIssueCatalog::load(&rt.catalog_path()).map_err(|e| e.to_string())?;

    match catalog.find(&text, ctx) {
        Some(issue) => {
            let json = serde_json::to_string_pretty(issue)
                .map_err(|e| format!("failed to serialize known issue: {e}"))?;
            println!("{json}");
            Ok(0)
        }
        None => Ok(1),
    }
}

fn read_stdin() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}

fn read_stdin_bytes() -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}
