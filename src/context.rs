//! The per-invocation execution context.
//!
//! Built once at the edge of the process from the environment and passed by
//! reference to every component. Nothing reads the environment after that.

use std::{env, path::PathBuf};

use crate::model::PipelinePhase;

/// Who and where this invocation is running.
#[derive(Debug, Clone)]
pub struct Context {
    /// Repository checkout root. All relative paths resolve against it.
    pub repo_root: PathBuf,

    pub session_id: String,
    pub commit_sha: String,
    pub run_id: String,
    pub run_attempt: String,

    /// `owner/name`, when known.
    pub repository: Option<String>,

    pub cpu_variant: Option<String>,

    /// Phase snapshot read once at startup.
    pub phase: Option<PipelinePhase>,
}

impl Context {
    /// A context with local defaults: no CI run, no session.
    pub fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            session_id: "local".to_string(),
            commit_sha: "unknown".to_string(),
            run_id: "local".to_string(),
            run_attempt: "1".to_string(),
            repository: None,
            cpu_variant: None,
            phase: None,
        }
    }

    /// Reads the CI environment once.
    ///
    /// `GITHUB_SHA`, `GITHUB_RUN_ID`, `GITHUB_RUN_ATTEMPT`, `GITHUB_REPOSITORY`,
    /// `HOOKLINE_SESSION_ID` and `HOOKLINE_CPU_VARIANT` override the local defaults.
    pub fn from_env(repo_root: PathBuf) -> Self {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        let mut ctx = Self::new(repo_root);
        if let Some(sha) = var("GITHUB_SHA") {
            ctx.commit_sha = sha;
        }
        if let Some(id) = var("GITHUB_RUN_ID") {
            ctx.run_id = id;
        }
        if let Some(attempt) = var("GITHUB_RUN_ATTEMPT") {
            ctx.run_attempt = attempt;
        }
        if let Some(session) = var("HOOKLINE_SESSION_ID") {
            ctx.session_id = session;
        }
        ctx.repository = var("GITHUB_REPOSITORY");
        ctx.cpu_variant = var("HOOKLINE_CPU_VARIANT");
        ctx
    }

    #[must_use]
    pub fn with_phase(mut self, phase: Option<PipelinePhase>) -> Self {
        self.phase = phase;
        self
    }

    /// The current phase id, if a phase is known.
    pub fn phase_id(&self) -> Option<&str> {
        self.phase.as_ref().map(|p| p.id.as_str())
    }
}

#[cfg(test)]
impl Context {
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    #[must_use]
    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = sha.into();
        self
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>, attempt: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self.run_attempt = attempt.into();
        self
    }
}
