//! Append-only JSONL journals: the audit trail and daily metric files.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::model::{AuditRecord, MetricRecord};

use super::Result;

/// Writer for the audit trail and metrics under the state root.
#[derive(Debug, Clone)]
pub struct Journal {
    root: PathBuf,
}

impl Journal {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    /// Metrics are split into one file per UTC day.
    pub fn metrics_path(&self, record: &MetricRecord) -> PathBuf {
        self.root.join("metrics").join(format!(
            "pipeline-metrics-{}.jsonl",
            record.timestamp.strftime("%Y-%m-%d")
        ))
    }

    pub fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        append_line(&self.audit_path(), record)
    }

    pub fn append_metric(&self, record: &MetricRecord) -> Result<()> {
        append_line(&self.metrics_path(record), record)
    }

    /// Reads back the audit trail, skipping lines that don't parse.
    pub fn read_audit(&self) -> Result<Vec<AuditRecord>> {
        read_lines(&self.audit_path())
    }
}

/// Appends one JSON line with a single write, so concurrent appenders
/// don't interleave within a line.
pub(super) fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

pub(super) fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
