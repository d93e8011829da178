//! Events: one trigger instance fed into the router.
//!
//! An event is built once from the raw hook payload plus the invocation
//! [`Context`], then only read. Its effects are persisted, never the event itself.

use std::fmt;

use serde_json::{Map, Value};

use crate::context::Context;

/// What kind of trigger produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Before a tool runs. Gates can block the tool.
    PreCommand,

    /// After a tool ran, with its exit code.
    PostCommand,

    /// A prompt was submitted.
    PromptSubmit,

    /// The session ended.
    SessionStop,

    /// Raw tool output was captured.
    ToolOutput,

    /// A user-issued slash command.
    SlashCommand,
}

impl EventKind {
    /// Every kind that arrives through event ingestion.
    pub const INGESTED: [Self; 5] = [
        Self::PreCommand,
        Self::PostCommand,
        Self::PromptSubmit,
        Self::ToolOutput,
        Self::SessionStop,
    ];

    /// Parses the wire name used by hook callers (`pre-tool-use`, `stop`, ...).
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "pre-tool-use" => Some(Self::PreCommand),
            "post-tool-use" => Some(Self::PostCommand),
            "user-prompt-submit" => Some(Self::PromptSubmit),
            "tool-output" => Some(Self::ToolOutput),
            "stop" => Some(Self::SessionStop),
            "slash-command" => Some(Self::SlashCommand),
            _ => None,
        }
    }

    /// The wire name for this kind.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::PreCommand => "pre-tool-use",
            Self::PostCommand => "post-tool-use",
            Self::PromptSubmit => "user-prompt-submit",
            Self::ToolOutput => "tool-output",
            Self::SessionStop => "stop",
            Self::SlashCommand => "slash-command",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Why a raw payload could not become an event.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,
}

/// One trigger instance.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: String,
    pub run_id: String,
    pub run_attempt: String,
    pub commit_sha: String,

    /// Caller-supplied unique id for this trigger, when the payload has one.
    pub event_id: Option<String>,

    pub tool_name: Option<String>,
    pub command: Option<String>,
    pub exit_code: Option<i32>,

    /// The full payload, kept opaque for handlers.
    pub payload: Value,
}

impl Event {
    /// Builds an event from a wire kind and a raw JSON payload.
    ///
    /// Only a payload that isn't a JSON object is malformed. Fields the router
    /// reads are picked out leniently: one with an unexpected type counts as
    /// absent rather than spoiling the whole event. Identity fields missing
    /// from the payload fall back to the context.
    pub fn parse(kind: EventKind, raw: impl AsRef<[u8]>, ctx: &Context) -> Result<Self, EventError> {
        let payload: Value = serde_json::from_slice(raw.as_ref())?;
        let Some(fields) = payload.as_object() else {
            return Err(EventError::NotAnObject);
        };

        let response = fields.get("tool_response");
        let command = fields
            .get("tool_input")
            .and_then(|input| text(input.get("command")))
            .or_else(|| text(fields.get("command")));
        let exit_code = code(fields.get("exit_code"))
            .or_else(|| code(response.and_then(|r| r.get("exit_code"))));
        let session_id = text(fields.get("session_id"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ctx.session_id.clone());
        let event_id = text(fields.get("tool_use_id"))
            .or_else(|| text(fields.get("event_id")))
            .filter(|s| !s.is_empty());
        let tool_name = text(fields.get("tool_name"));

        Ok(Self {
            kind,
            session_id,
            run_id: ctx.run_id.clone(),
            run_attempt: ctx.run_attempt.clone(),
            commit_sha: ctx.commit_sha.clone(),
            event_id,
            tool_name,
            command,
            exit_code,
            payload,
        })
    }

    /// The submitted prompt text, for prompt events.
    pub fn prompt(&self) -> Option<&str> {
        self.payload.get("prompt").and_then(Value::as_str)
    }

    /// The phase the caller expects to be running in, if it said.
    pub fn expected_phase(&self) -> Option<&str> {
        self.payload.get("expected_phase").and_then(Value::as_str)
    }

    /// Error text captured from the tool, newest output last.
    ///
    /// Looks at `stderr`, `output` and `stdout` at the top level and inside
    /// `tool_response`, joining whatever is present.
    pub fn error_text(&self) -> String {
        let mut parts = Vec::new();
        let response = self.payload.get("tool_response").and_then(Value::as_object);
        for source in [self.payload.as_object(), response].into_iter().flatten() {
            collect_text(source, &mut parts);
        }
        parts.join("\n")
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn code(value: Option<&Value>) -> Option<i32> {
    value
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
}

fn collect_text<'a>(source: &'a Map<String, Value>, parts: &mut Vec<&'a str>) {
    for key in ["stdout", "output", "stderr"] {
        if let Some(text) = source.get(key).and_then(Value::as_str)
            && !text.is_empty()
        {
            parts.push(text);
        }
    }
}
