//! PR comment posting through the `gh` CLI.
//!
//! Authentication comes from `gh` itself, optionally pointed at a per-identity
//! config dir via `GH_CONFIG_DIR`.

use std::{path::PathBuf, time::Duration};

use tracing::{debug, warn};

use crate::process::{self, ProcessSpec};

/// Posts human-readable responses on a pull request.
pub trait CommentPoster {
    fn post(&self, pr_number: u64, body: &str) -> Result<(), String>;
}

/// [`CommentPoster`] backed by `gh pr comment`.
#[derive(Debug, Clone)]
pub struct GhCommentPoster {
    repository: Option<String>,
    gh_config: Option<PathBuf>,
    timeout: Duration,
}

impl GhCommentPoster {
    pub fn new(repository: Option<String>) -> Self {
        Self {
            repository,
            gh_config: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Uses the `gh` config for `identity` under `~/.hookline/gh-config/`.
    #[must_use]
    pub fn with_identity(mut self, identity: &str) -> Self {
        self.gh_config = gh_config_dir(identity);
        if self.gh_config.is_none() {
            warn!(identity, "no home directory, using default gh config");
        }
        self
    }

    fn argv(&self, pr_number: u64, body: &str) -> Vec<String> {
        let mut argv = vec![
            "gh".to_string(),
            "pr".to_string(),
            "comment".to_string(),
            pr_number.to_string(),
            "--body".to_string(),
            body.to_string(),
        ];
        if let Some(repo) = &self.repository {
            argv.extend(["--repo".to_string(), repo.clone()]);
        }
        argv
    }
}

impl CommentPoster for GhCommentPoster {
    fn post(&self, pr_number: u64, body: &str) -> Result<(), String> {
        let argv = self.argv(pr_number, body);
        let mut spec = ProcessSpec::new(&argv);
        if let Some(dir) = &self.gh_config {
            spec = spec.env("GH_CONFIG_DIR", dir.to_string_lossy());
        }

        let output = process::run_with_timeout(&spec, self.timeout)
            .map_err(|e| format!("failed to run gh: {e}"))?;
        if !output.success() {
            return Err(format!("gh pr comment failed: {}", output.stderr.trim()));
        }
        debug!(pr_number, "comment posted");
        Ok(())
    }
}

/// Returns the `GH_CONFIG_DIR` path for a given identity.
fn gh_config_dir(identity: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".hookline").join("gh-config").join(identity))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::cell::RefCell;

    /// Collects comments instead of posting them.
    #[derive(Default)]
    pub(crate) struct RecordingPoster {
        pub comments: RefCell<Vec<(u64, String)>>,
    }

    impl CommentPoster for RecordingPoster {
        fn post(&self, pr_number: u64, body: &str) -> Result<(), String> {
            self.comments.borrow_mut().push((pr_number, body.to_string()));
            Ok(())
        }
    }

    #[test]
    fn argv_targets_repository() {
        let poster = GhCommentPoster::new(Some("owner/repo".into()));
        let argv = poster.argv(42, "hello");
        assert_eq!(
            argv,
            vec!["gh", "pr", "comment", "42", "--body", "hello", "--repo", "owner/repo"]
        );
    }

    #[test]
    fn argv_without_repository() {
        let argv = GhCommentPoster::new(None).argv(7, "x");
        assert!(!argv.contains(&"--repo".to_string()));
    }

    #[test]
    fn identity_config_dir() {
        if let Some(dir) = gh_config_dir("ci-bot") {
            assert!(dir.ends_with(".hookline/gh-config/ci-bot"));
        }
    }
}
