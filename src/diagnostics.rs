//! Diagnostic snapshots for file-related failures.
//!
//! Side reporting only: a snapshot that can't be written is logged and
//! dropped, never surfaced to the caller.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use jiff::Timestamp;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::write_json_atomic;

/// Substrings that mark an error as file-related.
const FILE_ERROR_MARKERS: &[&str] = &[
    "No such file or directory",
    "Permission denied",
    "cannot open",
    "not found",
    "File exists",
    "Is a directory",
    "Not a directory",
];

const MAX_PROBES: usize = 20;
const MAX_LISTING: usize = 200;

static PATH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:'([^'\s]+)'|`([^`\s]+)`|([A-Za-z0-9_.~-]*/[A-Za-z0-9_./~-]+))")
        .expect("valid path token regex")
});

pub fn is_file_related(text: &str) -> bool {
    FILE_ERROR_MARKERS.iter().any(|m| text.contains(m))
}

/// One entry in the working-directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: Option<u64>,
}

/// What exists at a path mentioned in the error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathProbe {
    pub path: String,
    pub exists: bool,

    /// `file`, `dir` or `symlink` when the path exists.
    pub kind: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub captured_at: Timestamp,
    pub working_dir: PathBuf,
    pub listing: Vec<DirectoryEntry>,
    pub probes: Vec<PathProbe>,
    pub environment: BTreeMap<String, String>,
    pub error_excerpt: String,
}

impl DiagnosticSnapshot {
    /// Gathers a snapshot. `env` is passed in so the caller decides what the
    /// process environment is.
    pub fn capture(
        error_text: &str,
        working_dir: &Path,
        env: impl IntoIterator<Item = (String, String)>,
        now: Timestamp,
    ) -> Self {
        Self {
            captured_at: now,
            working_dir: working_dir.to_path_buf(),
            listing: list_dir(working_dir),
            probes: path_tokens(error_text)
                .into_iter()
                .map(|token| probe(working_dir, &token))
                .collect(),
            environment: env.into_iter().filter(|(k, _)| keep_var(k)).collect(),
            error_excerpt: excerpt(error_text),
        }
    }

    /// Writes the snapshot under `dir`, logging rather than failing.
    pub fn write_to(&self, dir: &Path) -> Option<PathBuf> {
        let name = format!(
            "diagnostic-{}-{}.json",
            self.captured_at.strftime("%Y%m%d-%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let path = dir.join(name);
        match write_json_atomic(&path, self) {
            Ok(()) => {
                debug!(path = %path.display(), "diagnostic snapshot written");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "could not write diagnostic snapshot");
                None
            }
        }
    }
}

fn list_dir(dir: &Path) -> Vec<DirectoryEntry> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut listing: Vec<DirectoryEntry> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let metadata = entry.metadata().ok();
            let is_dir = metadata.as_ref().is_some_and(fs::Metadata::is_dir);
            DirectoryEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
                size_bytes: if is_dir {
                    None
                } else {
                    metadata.as_ref().map(fs::Metadata::len)
                },
            }
        })
        .collect();
    listing.sort_by(|a, b| a.name.cmp(&b.name));
    listing.truncate(MAX_LISTING);
    listing
}

fn path_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for caps in PATH_TOKEN.captures_iter(text) {
        let Some(token) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let token = token.as_str().trim_end_matches(['.', ',', ':']);
        if !token.is_empty() && !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
        if tokens.len() == MAX_PROBES {
            break;
        }
    }
    tokens
}

fn probe(base: &Path, token: &str) -> PathProbe {
    let path = base.join(token);
    match fs::symlink_metadata(&path) {
        Ok(meta) => {
            let kind = if meta.file_type().is_symlink() {
                "symlink"
            } else if meta.is_dir() {
                "dir"
            } else {
                "file"
            };
            PathProbe {
                path: token.to_string(),
                exists: true,
                kind: Some(kind.to_string()),
                size_bytes: meta.is_file().then(|| meta.len()),
            }
        }
        Err(_) => PathProbe {
            path: token.to_string(),
            exists: false,
            kind: None,
            size_bytes: None,
        },
    }
}

fn keep_var(name: &str) -> bool {
    matches!(name, "PATH" | "HOME" | "PWD" | "CI")
        || ["GITHUB_", "RUST", "CARGO"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 2000;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut start = text.len() - MAX;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
