//! The pipeline log: current phase, recent activity and phase history.
//!
//! A single JSON document shared with the rest of the CI tooling. Writers
//! serialize through the `status` lock; readers don't lock.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use jiff::{SignedDuration, Timestamp};
use serde_json::Value;
use tracing::{debug, info};

use crate::model::{PipelineLogDocument, PipelinePhase, StatusActivity};

use super::{LockManager, Result, read_json, write_json_atomic};

const LOCK_NAME: &str = "status";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ACTIVITIES: usize = 1000;

/// Append-only structured status log, as seen by the dispatcher.
pub trait StatusSink {
    fn append(&self, kind: &str, details: Value, now: Timestamp) -> Result<()>;
}

/// What a rotation did, or would do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotateReport {
    pub size_bytes: u64,

    /// Why rotation was needed; `None` when it wasn't.
    pub reason: Option<String>,

    pub archived_to: Option<PathBuf>,
    pub removed: usize,
}

/// Handle on `pipeline-log.json`.
#[derive(Debug, Clone)]
pub struct PipelineLog {
    path: PathBuf,
    archive_dir: PathBuf,
    locks: LockManager,
}

impl PipelineLog {
    pub fn new(path: impl Into<PathBuf>, locks: LockManager) -> Self {
        let path = path.into();
        let archive_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("archive"), |p| p.join("archive"));
        Self {
            path,
            archive_dir,
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole document. A missing file is an empty log.
    pub fn load(&self) -> Result<PipelineLogDocument> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn current_phase(&self) -> Result<Option<PipelinePhase>> {
        Ok(self.load()?.current_phase)
    }

    /// Makes `phase` current, moving the previous one into the history.
    pub fn set_phase(&self, mut phase: PipelinePhase, now: Timestamp) -> Result<()> {
        phase.started_at.get_or_insert(now);
        self.update(|doc| {
            if let Some(previous) = doc.current_phase.take() {
                doc.phase_history.push(previous);
            }
            info!(phase = %phase.id, status = %phase.status, "phase set");
            doc.current_phase = Some(phase);
        })
    }

    /// Puts phase `id` back to `pending` with no progress.
    ///
    /// If `id` isn't the current phase it becomes current, which is how a
    /// manual reset rewinds the pipeline.
    pub fn reset_phase(&self, id: &str, now: Timestamp) -> Result<PipelinePhase> {
        let mut reset = None;
        self.update(|doc| {
            let name = match &doc.current_phase {
                Some(p) if p.id == id => p.name.clone(),
                _ => doc
                    .phase_history
                    .iter()
                    .rev()
                    .find(|p| p.id == id)
                    .map_or_else(|| id.to_string(), |p| p.name.clone()),
            };
            let mut phase = PipelinePhase::new(id, name, "pending");
            phase.started_at = Some(now);
            if let Some(previous) = doc.current_phase.take()
                && previous.id != id
            {
                doc.phase_history.push(previous);
            }
            doc.current_phase = Some(phase.clone());
            reset = Some(phase);
        })?;
        info!(phase = id, "phase reset to pending");
        Ok(reset.unwrap_or_else(|| PipelinePhase::new(id, id, "pending")))
    }

    /// Appends an activity, keeping only the most recent entries.
    pub fn append(&self, kind: &str, details: Value, now: Timestamp) -> Result<()> {
        self.update(|doc| {
            doc.activities.push(StatusActivity {
                timestamp: now,
                kind: kind.to_string(),
                details,
            });
            if doc.activities.len() > MAX_ACTIVITIES {
                let excess = doc.activities.len() - MAX_ACTIVITIES;
                doc.activities.drain(..excess);
            }
        })
    }

    /// Archives and trims the log when it is too big or holds stale entries.
    pub fn rotate(
        &self,
        max_age: SignedDuration,
        max_size_bytes: u64,
        dry_run: bool,
        now: Timestamp,
    ) -> Result<RotateReport> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(RotateReport::default());
        };
        let mut report = RotateReport {
            size_bytes: meta.len(),
            ..RotateReport::default()
        };

        if meta.len() > max_size_bytes {
            report.reason = Some(format!(
                "size {} bytes exceeds {max_size_bytes} byte limit",
                meta.len()
            ));
        } else if let Some(oldest) = self.load()?.activities.iter().map(|a| a.timestamp).min()
            && now.duration_since(oldest) > max_age
        {
            report.reason = Some(format!("oldest entry is from {oldest}"));
        }

        if report.reason.is_none() || dry_run {
            return Ok(report);
        }

        self.locks
            .with_lock(LOCK_NAME, LOCK_TIMEOUT, || -> Result<()> {
                fs::create_dir_all(&self.archive_dir)?;
                let archive = self.archive_dir.join(format!(
                    "pipeline-log-{}.json",
                    now.strftime("%Y%m%d-%H%M%S")
                ));
                fs::copy(&self.path, &archive)?;

                let mut doc = self.load()?;
                let before = doc.activities.len();
                doc.activities
                    .retain(|a| now.duration_since(a.timestamp) <= max_age);
                report.removed = before - doc.activities.len();
                write_json_atomic(&self.path, &doc)?;

                info!(archive = %archive.display(), removed = report.removed, "pipeline log rotated");
                report.archived_to = Some(archive);
                Ok(())
            })??;
        Ok(report)
    }

    fn update(&self, f: impl FnOnce(&mut PipelineLogDocument)) -> Result<()> {
        self.locks.with_lock(LOCK_NAME, LOCK_TIMEOUT, || -> Result<()> {
            let mut doc = self.load()?;
            f(&mut doc);
            write_json_atomic(&self.path, &doc)?;
            debug!(path = %self.path.display(), "pipeline log written");
            Ok(())
        })?
    }
}

impl StatusSink for PipelineLog {
    fn append(&self, kind: &str, details: Value, now: Timestamp) -> Result<()> {
        PipelineLog::append(self, kind, details, now)
    }
}
