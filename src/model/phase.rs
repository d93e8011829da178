//! Pipeline phase: external state the core reads but does not own.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// A snapshot of the pipeline's current phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePhase {
    pub id: String,
    pub name: String,
    pub status: String,

    /// Completion in `[0, 1]`.
    #[serde(default)]
    pub progress: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
}

impl PipelinePhase {
    pub fn new(id: impl Into<String>, name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: status.into(),
            progress: 0.0,
            started_at: None,
        }
    }

    /// Sets progress, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        self
    }
}
