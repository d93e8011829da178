//! Known-issue catalog entries.

use serde::{Deserialize, Serialize};

/// One cataloged failure signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownIssue {
    pub id: String,

    /// Substring to look for, or a regex when `regex` is set.
    pub pattern: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub regex: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Restricts the entry to one pipeline phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Restricts the entry to one CPU variant (e.g. `m68040`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_variant: Option<String>,

    /// Executable to run as the remedy, relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_fix: Option<String>,
}

impl KnownIssue {
    /// A plain substring entry with no restrictions and no fix.
    #[cfg(test)]
    pub fn substring(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            regex: false,
            description: None,
            phase: None,
            cpu_variant: None,
            auto_fix: None,
        }
    }
}

/// On-disk shape of the catalog file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub issues: Vec<KnownIssue>,
}
