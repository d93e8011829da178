//! Command-name and argument validation.
//!
//! Everything here is pure: nothing runs until a request has passed.

use std::{fmt, sync::LazyLock};

use regex::Regex;

static COMMAND_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9-]{1,50}$").expect("valid command name regex"));

static JOB_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,50}$").expect("valid job name regex"));

static PHASE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^phase-[0-9]{1,3}$").expect("valid phase id regex"));

static PR_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,10}$").expect("valid pr number regex"));

// GitHub logins: alphanumerics and single inner hyphens, at most 39 long.
static USERNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9](?:-?[a-zA-Z0-9]){0,38}$").expect("valid username regex")
});

/// Services `ci-review` can ask.
const REVIEW_SERVICES: &[&str] = &["gemini", "o3"];

/// Why a request was refused before anything ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid command name '{0}': use 1-50 letters, digits or '-'")]
    InvalidName(String),

    #[error("unknown command '{0}'; try ci-help")]
    UnknownCommand(String),

    #[error("{command}: invalid {argument} '{value}': {reason}")]
    InvalidArgument {
        command: String,
        argument: ArgKind,
        value: String,
        reason: String,
    },
}

/// The shape of a command's single argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    None,
    JobName,
    PhaseId,
    PrNumber,
    OptionalUsername,
    Service,
}

impl ArgKind {
    /// Placeholder shown in help text.
    pub fn hint(self) -> &'static str {
        match self {
            Self::None => "",
            Self::JobName => "<job>",
            Self::PhaseId => "<phase-N>",
            Self::PrNumber => "<pr-number>",
            Self::OptionalUsername => "[user]",
            Self::Service => "<gemini|o3>",
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "argument",
            Self::JobName => "job name",
            Self::PhaseId => "phase id",
            Self::PrNumber => "pull request number",
            Self::OptionalUsername => "username",
            Self::Service => "service",
        })
    }
}

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if COMMAND_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidName(truncate(name)))
    }
}

/// Checks `raw` against `kind`, returning the trimmed argument if there is one.
pub fn validate_arg(command: &str, kind: ArgKind, raw: &str) -> Result<Option<String>, ValidationError> {
    let value = raw.trim();
    let invalid = |reason: &str| ValidationError::InvalidArgument {
        command: command.to_string(),
        argument: kind,
        value: truncate(value),
        reason: reason.to_string(),
    };

    let ok = match kind {
        ArgKind::None if value.is_empty() => return Ok(None),
        ArgKind::None => return Err(invalid("this command takes no argument")),
        ArgKind::OptionalUsername if value.is_empty() => return Ok(None),
        _ if value.is_empty() => return Err(invalid("an argument is required")),
        ArgKind::JobName => JOB_NAME.is_match(value),
        ArgKind::PhaseId => PHASE_ID.is_match(value),
        ArgKind::PrNumber => PR_NUMBER.is_match(value) && value.bytes().any(|b| b != b'0'),
        ArgKind::OptionalUsername => USERNAME.is_match(value),
        ArgKind::Service => REVIEW_SERVICES.contains(&value),
    };
    if ok {
        return Ok(Some(value.to_string()));
    }

    Err(invalid(match kind {
        ArgKind::JobName => "use 1-50 letters, digits, '_' or '-'",
        ArgKind::PhaseId => "expected phase-N, e.g. phase-3",
        ArgKind::PrNumber => "expected a positive number",
        ArgKind::OptionalUsername => {
            "use letters, digits and single hyphens, at most 39 characters"
        }
        ArgKind::Service => "expected gemini or o3",
        ArgKind::None => "this command takes no argument",
    }))
}

/// Caps echoed input so a hostile argument can't flood the reply.
fn truncate(value: &str) -> String {
    const MAX: usize = 60;
    match value.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}
