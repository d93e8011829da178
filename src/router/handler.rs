//! Handlers and the per-kind registry.

use std::{
    collections::HashMap,
    path::Path,
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    config::{Config, HookConfig},
    context::Context,
    model::{Event, EventKind, HandlerOutcome},
    process::{self, ProcessSpec},
};

/// One pluggable reaction to an event.
pub trait Handler {
    fn name(&self) -> &str;

    /// A gate's failure rejects the event and suppresses everything after it.
    fn is_gate(&self) -> bool {
        false
    }

    /// Whether this handler wants `event` at all. Skipped handlers don't count
    /// as run.
    fn applies_to(&self, _event: &Event) -> bool {
        true
    }

    fn handle(&self, event: &Event, ctx: &Context) -> HandlerOutcome;
}

/// A configured external script.
///
/// Gets the raw payload on stdin and the event summary as `HOOKLINE_*`
/// environment variables. A non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct ScriptHandler {
    name: String,
    argv: Vec<String>,
    gate: bool,
    timeout: Duration,
    tools: Vec<String>,
}

impl ScriptHandler {
    pub fn from_config(hook: &HookConfig, repo_root: &Path) -> Self {
        let mut argv = hook.command.clone();
        if let Some(program) = argv.first_mut()
            && program.contains('/')
        {
            let resolved = Config::resolve(repo_root, Path::new(program.as_str()));
            *program = resolved.to_string_lossy().into_owned();
        }
        Self {
            name: hook.name.clone(),
            argv,
            gate: hook.gate,
            timeout: Duration::from_secs(hook.timeout_secs),
            tools: hook.tools.clone(),
        }
    }

    fn environment(event: &Event, ctx: &Context) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("HOOKLINE_EVENT", event.kind.as_wire().to_string()),
            ("HOOKLINE_SESSION_ID", event.session_id.clone()),
            ("HOOKLINE_COMMIT_SHA", event.commit_sha.clone()),
            ("HOOKLINE_RUN_ID", event.run_id.clone()),
            ("HOOKLINE_RUN_ATTEMPT", event.run_attempt.clone()),
        ];
        if let Some(tool) = &event.tool_name {
            env.push(("HOOKLINE_TOOL_NAME", tool.clone()));
        }
        if let Some(command) = &event.command {
            env.push(("HOOKLINE_COMMAND", command.clone()));
        }
        if let Some(code) = event.exit_code {
            env.push(("HOOKLINE_EXIT_CODE", code.to_string()));
        }
        if let Some(phase) = ctx.phase_id() {
            env.push(("HOOKLINE_PHASE", phase.to_string()));
        }
        env
    }
}

impl Handler for ScriptHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_gate(&self) -> bool {
        self.gate
    }

    fn applies_to(&self, event: &Event) -> bool {
        self.tools.is_empty()
            || event
                .tool_name
                .as_ref()
                .is_some_and(|tool| self.tools.iter().any(|t| t == tool))
    }

    fn handle(&self, event: &Event, ctx: &Context) -> HandlerOutcome {
        let payload = event.payload.to_string();
        let mut spec = ProcessSpec::new(&self.argv)
            .cwd(&ctx.repo_root)
            .stdin(payload.as_bytes());
        for (key, value) in Self::environment(event, ctx) {
            spec = spec.env(key, value);
        }

        match process::run_with_timeout(&spec, self.timeout) {
            Ok(output) if output.success() => {
                debug!(handler = %self.name, "handler succeeded");
                HandlerOutcome::Success
            }
            Ok(output) => {
                let stderr = output.stderr.trim();
                let message = if stderr.is_empty() {
                    format!("exited with {}", output.code())
                } else {
                    stderr.to_string()
                };
                HandlerOutcome::failed(output.exit_code, message)
            }
            Err(e) => HandlerOutcome::failed(None, e.to_string()),
        }
    }
}

/// Maps each event kind to its handlers, in registration order.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<EventKind, Vec<Box<dyn Handler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a script handler for every configured hook.
    ///
    /// Hooks naming an unknown kind are skipped; config validation normally
    /// catches them first.
    pub fn register_hooks(&mut self, hooks: &[HookConfig], repo_root: &Path) {
        for hook in hooks {
            match hook.kind() {
                Some(kind) => {
                    self.register(kind, Box::new(ScriptHandler::from_config(hook, repo_root)));
                }
                None => warn!(hook = %hook.name, event = %hook.event, "skipping hook with unknown event"),
            }
        }
    }

    pub fn register(&mut self, kind: EventKind, handler: Box<dyn Handler>) {
        debug!(event = %kind, handler = handler.name(), gate = handler.is_gate(), "handler registered");
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Handlers for `kind`: gates first, then the rest, each group in
    /// registration order.
    pub fn ordered(&self, kind: EventKind) -> Vec<&dyn Handler> {
        let Some(handlers) = self.handlers.get(&kind) else {
            return Vec::new();
        };
        let gates = handlers.iter().filter(|h| h.is_gate());
        let rest = handlers.iter().filter(|h| !h.is_gate());
        gates.chain(rest).map(|h| &**h).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use tempfile::TempDir;

    struct Named(&'static str, bool);

    impl Handler for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn is_gate(&self) -> bool {
            self.1
        }

        fn handle(&self, _: &Event, _: &Context) -> HandlerOutcome {
            HandlerOutcome::Success
        }
    }

    fn hook(command: &[&str]) -> HookConfig {
        HookConfig {
            event: "post-tool-use".into(),
            name: "script".into(),
            command: command.iter().map(ToString::to_string).collect(),
            gate: false,
            timeout_secs: 5,
            tools: Vec::new(),
        }
    }

    fn post_event(ctx: &Context, raw: &str) -> Event {
        Event::parse(EventKind::PostCommand, raw, ctx).unwrap()
    }

    #[test]
    fn gates_come_first_in_registration_order() {
        let mut registry = Registry::new();
        registry.register(EventKind::PreCommand, Box::new(Named("log", false)));
        registry.register(EventKind::PreCommand, Box::new(Named("phase", true)));
        registry.register(EventKind::PreCommand, Box::new(Named("notify", false)));
        registry.register(EventKind::PreCommand, Box::new(Named("lint", true)));

        let names: Vec<_> = registry
            .ordered(EventKind::PreCommand)
            .iter()
            .map(|h| h.name().to_string())
            .collect();

        assert_eq!(names, vec!["phase", "lint", "log", "notify"]);
        assert!(registry.ordered(EventKind::SessionStop).is_empty());
    }

    #[test]
    fn register_hooks_files_each_under_its_kind() {
        let mut pre = hook(&["true"]);
        pre.event = "pre-tool-use".into();
        pre.gate = true;
        let mut unknown = hook(&["true"]);
        unknown.event = "bogus".into();

        let mut registry = Registry::new();
        registry.register(EventKind::PreCommand, Box::new(Named("phase", true)));
        registry.register_hooks(&[pre, hook(&["true"]), unknown], Path::new("/repo"));

        let pre_names: Vec<_> = registry
            .ordered(EventKind::PreCommand)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(pre_names, vec!["phase", "script"]);
        assert_eq!(registry.ordered(EventKind::PostCommand).len(), 1);
    }

    #[test]
    fn script_sees_payload_and_environment() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("seen.txt");
        let script = format!(
            "cat > {out}; echo \"$HOOKLINE_EVENT $HOOKLINE_COMMAND $HOOKLINE_EXIT_CODE\" >> {out}",
            out = out.display()
        );
        let handler = ScriptHandler::from_config(&hook(&["sh", "-c", &script]), dir.path());
        let ctx = Context::new(dir.path().to_path_buf());
        let event = post_event(&ctx, r#"{"command": "make", "exit_code": 3}"#);

        assert_eq!(handler.handle(&event, &ctx), HandlerOutcome::Success);

        let seen = std::fs::read_to_string(&out).unwrap();
        assert!(seen.contains(r#""command":"make""#));
        assert!(seen.trim_end().ends_with("post-tool-use make 3"));
    }

    #[test]
    fn script_failure_carries_stderr() {
        let handler = ScriptHandler::from_config(
            &hook(&["sh", "-c", "echo broken >&2; exit 4"]),
            Path::new("/"),
        );
        let ctx = Context::new(PathBuf::from("/"));

        let outcome = handler.handle(&post_event(&ctx, "{}"), &ctx);

        assert_eq!(outcome, HandlerOutcome::failed(Some(4), "broken"));
    }

    #[test]
    fn unread_payload_cannot_outlast_the_timeout() {
        let mut config = hook(&["sh", "-c", "sleep 4"]);
        config.timeout_secs = 1;
        let handler = ScriptHandler::from_config(&config, Path::new("/"));
        let ctx = Context::new(PathBuf::from("/"));
        let big = format!(r#"{{"output": "{}"}}"#, "x".repeat(300 * 1024));
        let event = post_event(&ctx, &big);
        let started = std::time::Instant::now();

        let outcome = handler.handle(&event, &ctx);

        assert!(matches!(outcome, HandlerOutcome::Failed { exit_code: None, .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn tools_filter() {
        let mut config = hook(&["true"]);
        config.tools = vec!["Bash".into()];
        let handler = ScriptHandler::from_config(&config, Path::new("/"));
        let ctx = Context::new(PathBuf::from("/"));

        assert!(handler.applies_to(&post_event(&ctx, r#"{"tool_name": "Bash"}"#)));
        assert!(!handler.applies_to(&post_event(&ctx, r#"{"tool_name": "Edit"}"#)));
        assert!(!handler.applies_to(&post_event(&ctx, "{}")));
    }

    #[test]
    fn relative_script_paths_resolve_against_repo() {
        let handler = ScriptHandler::from_config(&hook(&["ci/hooks/check.sh", "-v"]), Path::new("/repo"));
        assert_eq!(handler.argv, vec!["/repo/ci/hooks/check.sh", "-v"]);

        let bare = ScriptHandler::from_config(&hook(&["true"]), Path::new("/repo"));
        assert_eq!(bare.argv, vec!["true"]);
    }
}
