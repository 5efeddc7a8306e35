//! Workstream discovery.
//!
//! Workstreams live as markdown files under `docs/workstreams/backlog/`,
//! named `<PP>-<FFF>-<NN>-<slug>.md`. A feature `F016` owns every file with
//! the `00-016-` prefix. Optional YAML frontmatter carries the title, status,
//! dependencies and the file globs the workstream is allowed to touch.
//!
//! Discovery is read-only; completion is inferred from repository state.

use crate::checkpoint::{validate_feature_id, workstream_prefix};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const BACKLOG_DIR: &str = "docs/workstreams/backlog";
pub const COMPLETED_DIR: &str = "docs/workstreams/completed";

#[derive(Debug, Clone, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    ws_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    scope: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workstream {
    pub id: String,
    pub title: String,
    pub completed: bool,
    pub depends_on: Vec<String>,
    /// Glob patterns for files this workstream may change.
    pub scope: Vec<String>,
    pub path: PathBuf,
    /// Markdown body with the frontmatter stripped.
    pub body: String,
}

impl Workstream {
    /// Minimal pending workstream, used where only the id matters.
    pub fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: id.to_string(),
            completed: false,
            depends_on: Vec::new(),
            scope: Vec::new(),
            path: PathBuf::new(),
            body: String::new(),
        }
    }
}

/// Split a document into (frontmatter, rest). `None` frontmatter when the
/// document doesn't open with a `---` fence.
fn split_frontmatter(contents: &str) -> (Option<&str>, &str) {
    let Some(after) = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))
    else {
        return (None, contents);
    };
    match after.find("\n---") {
        Some(end) => {
            let rest = &after[end + 4..];
            let rest = rest.trim_start_matches(['\r', '\n']);
            (Some(&after[..end]), rest)
        }
        None => (None, contents),
    }
}

/// Workstream id from a file stem: the leading `PP-FFF-NN`.
fn id_from_stem(stem: &str) -> Option<String> {
    let parts: Vec<&str> = stem.splitn(4, '-').collect();
    if parts.len() < 3 {
        return None;
    }
    let well_formed = parts[0].len() == 2
        && parts[1].len() == 3
        && parts[2].len() == 2
        && parts[..3]
            .iter()
            .all(|p| p.chars().all(|c| c.is_ascii_digit()));
    well_formed.then(|| format!("{}-{}-{}", parts[0], parts[1], parts[2]))
}

fn is_completed_status(status: Option<&str>) -> bool {
    matches!(
        status.map(|s| s.trim().to_lowercase()).as_deref(),
        Some("completed" | "done")
    )
}

fn parse_file(path: &Path, id: String) -> Result<Workstream> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read workstream file {}", path.display()))?;
    let (frontmatter, body) = split_frontmatter(&contents);
    let meta: Frontmatter = match frontmatter {
        Some(raw) => match serde_yaml::from_str(raw) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed workstream frontmatter");
                Frontmatter::default()
            }
        },
        None => Frontmatter::default(),
    };

    if let Some(declared) = &meta.ws_id
        && declared != &id
    {
        tracing::warn!(file_id = %id, declared = %declared, "ws_id in frontmatter disagrees with file name; using file name");
    }

    let title = meta.title.clone().unwrap_or_else(|| {
        body.lines()
            .find_map(|l| l.strip_prefix("# "))
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| id.clone())
    });

    Ok(Workstream {
        completed: is_completed_status(meta.status.as_deref()),
        id,
        title,
        depends_on: meta.depends_on,
        scope: meta.scope,
        path: path.to_path_buf(),
        body: body.to_string(),
    })
}

fn completed_ids_on_disk(project_dir: &Path, prefix: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(project_dir.join(COMPLETED_DIR)) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(id_from_stem)
            } else {
                None
            }
        })
        .filter(|id| id.starts_with(prefix))
        .collect()
}

/// Discover every workstream of `feature_id`, sorted by id.
pub fn discover(project_dir: &Path, feature_id: &str) -> Result<Vec<Workstream>> {
    validate_feature_id(feature_id)?;
    let prefix = workstream_prefix(feature_id);
    let backlog = project_dir.join(BACKLOG_DIR);

    let entries = match fs::read_dir(&backlog) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %backlog.display(), "no workstream backlog");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", backlog.display()));
        }
    };

    let mut workstreams = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "md") {
            continue;
        }
        let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(id_from_stem)
        else {
            continue;
        };
        if !id.starts_with(&prefix) {
            continue;
        }
        workstreams.push(parse_file(&path, id)?);
    }

    let done = completed_ids_on_disk(project_dir, &prefix);
    for ws in &mut workstreams {
        if done.contains(&ws.id) {
            ws.completed = true;
        }
    }

    workstreams.sort_by(|a, b| a.id.cmp(&b.id));
    workstreams.dedup_by(|a, b| a.id == b.id);
    tracing::debug!(feature = feature_id, count = workstreams.len(), "discovered workstreams");
    Ok(workstreams)
}
