//! Built-in blocking gates: the security precheck and phase alignment.

use regex::Regex;
use tracing::warn;

use crate::{
    context::Context,
    model::{Event, EventKind, HandlerOutcome},
};

use super::Handler;

/// Destructive shell idioms rejected in prompts and commands.
const DEFAULT_FORBIDDEN: &[(&str, &str)] = &[
    // Recursive plus force in any spelling: one flag cluster, split short
    // flags, or long options, with other flags in between.
    (
        "rm -rf",
        concat!(
            r"(?i)\brm(?:\s+-\S*)*?\s+(?:",
            r"-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*",
            r"|(?:-[a-z]*r[a-z]*|--recursive)(?:\s+-\S*)*?\s+(?:-[a-z]*f[a-z]*|--force)",
            r"|(?:-[a-z]*f[a-z]*|--force)(?:\s+-\S*)*?\s+(?:-[a-z]*r[a-z]*|--recursive)",
            r")",
        ),
    ),
    ("fork bomb", r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    ("mkfs", r"\bmkfs(?:\.\w+)?\b"),
    ("dd to block device", r"\bdd\b[^\n]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)"),
    ("chmod 777 /", r"\bchmod\s+(?:-R|--recursive)\s+0?777\s+/(?:\s|$)"),
    ("remote script piped to shell", r"\b(?:curl|wget)\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b"),
];

/// Scans prompt and command text for forbidden patterns.
///
/// Runs before every handler, whatever the registry holds.
#[derive(Debug, Clone)]
pub struct SecurityGate {
    patterns: Vec<(String, Regex)>,
}

impl SecurityGate {
    /// Gate name reported in rejections.
    pub const NAME: &'static str = "security";

    /// The built-in patterns plus `extra`, each extra one named by its source.
    pub fn new(extra: &[impl AsRef<str>]) -> Result<Self, regex::Error> {
        let mut patterns = Vec::with_capacity(DEFAULT_FORBIDDEN.len() + extra.len());
        for (name, pattern) in DEFAULT_FORBIDDEN {
            patterns.push(((*name).to_string(), Regex::new(pattern)?));
        }
        for pattern in extra {
            let pattern = pattern.as_ref();
            patterns.push((pattern.to_string(), Regex::new(pattern)?));
        }
        Ok(Self { patterns })
    }

    /// The text this gate inspects, if the event kind carries any.
    fn subject<'e>(event: &'e Event) -> Option<&'e str> {
        match event.kind {
            EventKind::PromptSubmit => event.prompt(),
            EventKind::PreCommand => event.command.as_deref(),
            _ => None,
        }
    }

    /// Returns the rejection reason, or `None` when the event is clean.
    pub fn check(&self, event: &Event) -> Option<String> {
        let text = Self::subject(event)?;
        let (name, _) = self.patterns.iter().find(|(_, re)| re.is_match(text))?;
        warn!(event = %event.kind, pattern = %name, "forbidden pattern rejected");
        Some(format!("matched forbidden pattern '{name}'"))
    }
}

/// Blocks commands while the pipeline phase forbids them, or when the caller
/// expected a different phase than the current one.
#[derive(Debug, Clone)]
pub struct PhaseAlignmentGate {
    blocking_statuses: Vec<String>,
}

impl PhaseAlignmentGate {
    pub fn new(blocking_statuses: Vec<String>) -> Self {
        Self { blocking_statuses }
    }
}

impl Handler for PhaseAlignmentGate {
    fn name(&self) -> &str {
        "phase-alignment"
    }

    fn is_gate(&self) -> bool {
        true
    }

    fn applies_to(&self, event: &Event) -> bool {
        event.kind == EventKind::PreCommand
    }

    fn handle(&self, event: &Event, ctx: &Context) -> HandlerOutcome {
        // No phase information: nothing to align against.
        let Some(phase) = &ctx.phase else {
            return HandlerOutcome::Success;
        };
        if self.blocking_statuses.iter().any(|s| *s == phase.status) {
            return HandlerOutcome::failed(
                None,
                format!("phase {} ({}) is {}", phase.id, phase.name, phase.status),
            );
        }
        if let Some(expected) = event.expected_phase()
            && expected != phase.id
        {
            return HandlerOutcome::failed(
                None,
                format!("expected phase {expected}, but current phase is {}", phase.id),
            );
        }
        HandlerOutcome::Success
    }
}
