//! Known-issue matching: classify raw error text against an ordered catalog.
//!
//! Pure classification. Nothing here runs a remedy; callers decide what to do
//! with a match.

use std::{fs, io, path::Path};

use regex::Regex;
use tracing::debug;

use crate::model::{CatalogFile, KnownIssue};

/// Errors from loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("could not read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid catalog {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("known issue '{id}' has an invalid regex: {source}")]
    Regex {
        id: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
enum Matcher {
    Substring(String),
    Regex(Regex),
}

impl Matcher {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Substring(needle) => !needle.is_empty() && text.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(text),
        }
    }
}

/// Structured context narrowing which entries apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchContext<'a> {
    pub phase: Option<&'a str>,
    pub cpu_variant: Option<&'a str>,
}

/// The loaded, compiled catalog, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct KnownIssueCatalog {
    entries: Vec<(KnownIssue, Matcher)>,
}

impl KnownIssueCatalog {
    /// Loads the catalog at `path`. A missing file is an empty catalog.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no known-issue catalog");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(CatalogError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let file: CatalogFile = serde_json::from_str(&contents).map_err(|source| CatalogError::Json {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_issues(file.issues)
    }

    pub fn from_issues(issues: Vec<KnownIssue>) -> Result<Self, CatalogError> {
        let entries = issues
            .into_iter()
            .map(|issue| {
                let matcher = if issue.regex {
                    Matcher::Regex(Regex::new(&issue.pattern).map_err(|source| {
                        CatalogError::Regex {
                            id: issue.id.clone(),
                            source,
                        }
                    })?)
                } else {
                    Matcher::Substring(issue.pattern.clone())
                };
                Ok((issue, matcher))
            })
            .collect::<Result<_, CatalogError>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry, in catalog order, that applies to `ctx` and matches `text`.
    pub fn find(&self, text: &str, ctx: MatchContext<'_>) -> Option<&KnownIssue> {
        self.entries
            .iter()
            .filter(|(issue, _)| applies(issue.phase.as_deref(), ctx.phase))
            .filter(|(issue, _)| applies(issue.cpu_variant.as_deref(), ctx.cpu_variant))
            .find(|(_, matcher)| matcher.is_match(text))
            .map(|(issue, _)| issue)
    }
}

/// An entry is skipped only when both sides name a value and they differ.
/// Unrestricted entries and unknown context values match anything.
fn applies(restriction: Option<&str>, actual: Option<&str>) -> bool {
    match (restriction, actual) {
        (Some(wanted), Some(actual)) => wanted == actual,
        _ => true,
    }
}
