//! Hookline configuration.
//!
//! Loaded from `<repo>/.hookline/config.toml`, falling back to
//! `~/.hookline/config.toml`. Every key is optional; a missing file means
//! defaults throughout.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{model::EventKind, storage::BudgetLimits};

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config at {path}: {message}")]
    Invalid { path: String, message: String },
}

/// Hookline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub paths: PathsConfig,
    pub ledger: LedgerConfig,
    pub backoff: BackoffConfig,
    pub lock: LockConfig,
    pub escalation: EscalationConfig,
    pub advisory: AdvisoryConfig,
    pub security: SecurityConfig,
    pub phase: PhaseConfig,
    pub slash: SlashConfig,
    pub hooks: Vec<HookConfig>,
}

/// Where state and shared CI files live, relative to the repository root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub pipeline_log: PathBuf,
    pub known_issues: PathBuf,

    /// Directories removed by `ci-clear-cache`.
    pub cache_dirs: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".hookline/state"),
            pipeline_log: PathBuf::from("docs/ci-status/pipeline-log.json"),
            known_issues: PathBuf::from("docs/ci-status/known-issues.json"),
            cache_dirs: vec![PathBuf::from(".cache/ci")],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LedgerConfig {
    pub retention_days: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackoffConfig {
    pub retention_days: u32,
    pub commit_ceiling: u32,
    pub lock_timeout_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            commit_ceiling: 3,
            lock_timeout_secs: 5,
        }
    }
}

/// The command-mutation lock.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LockConfig {
    pub timeout_secs: u64,
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            retry_interval_ms: 1000,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EscalationConfig {
    pub command_threshold: u32,
    pub min_error_len: usize,

    /// Replaces the built-in complex-failure patterns when set.
    pub complex_patterns: Option<Vec<String>>,

    pub auto_fix_timeout_secs: u64,
    pub diagnostics: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            command_threshold: 2,
            min_error_len: 500,
            complex_patterns: None,
            auto_fix_timeout_secs: 60,
            diagnostics: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AdvisoryConfig {
    /// Service named in escalation requests.
    pub service: String,

    /// Program (argv) that receives advisory requests as JSON on stdin.
    /// Empty disables advisory calls.
    pub command: Vec<String>,

    pub max_requests_per_day: u32,
    pub max_requests_per_hour: u32,
    pub cooldown_minutes: u32,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        let limits = BudgetLimits::default();
        Self {
            service: "gemini".to_string(),
            command: Vec::new(),
            max_requests_per_day: limits.max_requests_per_day,
            max_requests_per_hour: limits.max_requests_per_hour,
            cooldown_minutes: limits.cooldown_minutes,
        }
    }
}

impl AdvisoryConfig {
    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            max_requests_per_day: self.max_requests_per_day,
            max_requests_per_hour: self.max_requests_per_hour,
            cooldown_minutes: self.cooldown_minutes,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SecurityConfig {
    /// Regexes rejected in addition to the built-in list.
    pub extra_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PhaseConfig {
    /// Phase statuses in which pre-command gates block.
    pub blocking_statuses: Vec<String>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            blocking_statuses: vec!["halted".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SlashConfig {
    pub rate_limit_secs: u64,
    pub dedup_bucket_secs: i64,

    /// `gh` identity used to post replies; the default `gh` login when unset.
    pub identity: Option<String>,
}

impl Default for SlashConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 30,
            dedup_bucket_secs: 30,
            identity: None,
        }
    }
}

/// A handler script bound to one event kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookConfig {
    /// Wire name of the event, e.g. `pre-tool-use`.
    pub event: String,
    pub name: String,

    /// Program and arguments, resolved against the repository root.
    pub command: Vec<String>,

    /// A gate's failure blocks the event.
    #[serde(default)]
    pub gate: bool,

    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,

    /// Only run for these tool names; empty means every tool.
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_hook_timeout() -> u64 {
    10
}

impl HookConfig {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_wire(&self.event)
    }
}

impl Config {
    /// Loads configuration for the checkout at `repo_root`.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let local = Self::repo_path(repo_root);
        if local.exists() {
            return Self::load_from(&local);
        }
        match Self::global_path() {
            Some(global) if global.exists() => Self::load_from(&global),
            _ => Ok(Self::default()),
        }
    }

    /// Loads and validates one file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: display.clone(),
            source,
        })?;
        config
            .validate()
            .map_err(|message| ConfigError::Invalid {
                path: display,
                message,
            })?;
        Ok(config)
    }

    /// The per-checkout config file: `<repo>/.hookline/config.toml`.
    pub fn repo_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".hookline").join("config.toml")
    }

    /// The fallback config file: `~/.hookline/config.toml`.
    pub fn global_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".hookline").join("config.toml"))
    }

    fn validate(&self) -> Result<(), String> {
        for hook in &self.hooks {
            match hook.kind() {
                None => {
                    return Err(format!(
                        "hook '{}' has unknown event '{}'",
                        hook.name, hook.event
                    ));
                }
                Some(EventKind::SlashCommand) => {
                    return Err(format!(
                        "hook '{}': slash commands are built in and can't be hooked",
                        hook.name
                    ));
                }
                Some(_) => {}
            }
            if hook.command.is_empty() {
                return Err(format!("hook '{}' has an empty command", hook.name));
            }
        }
        if self.slash.dedup_bucket_secs <= 0 {
            return Err("slash.dedup-bucket-secs must be positive".to_string());
        }
        Ok(())
    }

    /// Resolves a configured path against the repository root.
    pub fn resolve(repo_root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_root.join(path)
        }
    }
}
