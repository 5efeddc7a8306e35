//! Run markers: one small file per feature+branch run, used to tell whether
//! a feature has an in-flight run that can be resumed.

use super::validate_feature_id;
use crate::errors::CheckpointError;
use crate::util::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMarker {
    pub run_id: Uuid,
    pub feature_id: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub last_action: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunsDir {
    dir: PathBuf,
}

/// Make a branch name safe for use inside a file name.
pub fn sanitize_branch(branch: &str) -> String {
    let cleaned: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "detached".to_string()
    } else {
        trimmed.to_string()
    }
}

impl RunsDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, feature_id: &str, branch: &str) -> Result<PathBuf, CheckpointError> {
        validate_feature_id(feature_id)?;
        Ok(self
            .dir
            .join(format!("{}-{}.json", feature_id, sanitize_branch(branch))))
    }

    pub fn load(&self, feature_id: &str, branch: &str) -> Result<Option<RunMarker>, CheckpointError> {
        let path = self.marker_path(feature_id, branch)?;
        read_marker(&path)
    }

    /// Create or refresh the marker for this run, keeping its `run_id` and
    /// `started_at` when one already exists.
    pub fn touch(
        &self,
        feature_id: &str,
        branch: &str,
        last_action: &str,
    ) -> Result<RunMarker, CheckpointError> {
        let path = self.marker_path(feature_id, branch)?;
        let now = Utc::now();
        let marker = match read_marker(&path)? {
            Some(mut existing) => {
                existing.last_action = last_action.to_string();
                existing.updated_at = now;
                existing
            }
            None => RunMarker {
                run_id: Uuid::new_v4(),
                feature_id: feature_id.to_string(),
                branch: branch.to_string(),
                started_at: now,
                last_action: last_action.to_string(),
                updated_at: now,
            },
        };
        write_json_atomic(&path, &marker).map_err(|source| CheckpointError::Io { path, source })?;
        Ok(marker)
    }

    /// Every run marker recorded for `feature_id`, most recently updated first.
    pub fn list_for(&self, feature_id: &str) -> Result<Vec<RunMarker>, CheckpointError> {
        validate_feature_id(feature_id)?;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        let prefix = format!("{}-", feature_id);
        let mut markers = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            match read_marker(&entry.path()) {
                Ok(Some(marker)) if marker.feature_id == feature_id => markers.push(marker),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable run marker"),
            }
        }
        markers.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(markers)
    }
}

fn read_marker(path: &Path) -> Result<Option<RunMarker>, CheckpointError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_branch() {
        assert_eq!(sanitize_branch("feature/F016"), "feature-F016");
        assert_eq!(sanitize_branch("../../etc"), "etc");
        assert_eq!(sanitize_branch("///"), "detached");
    }

    #[test]
    fn test_touch_keeps_run_identity() {
        let dir = tempdir().unwrap();
        let runs = RunsDir::new(dir.path());
        let first = runs.touch("F016", "feature/F016", "build").unwrap();
        let second = runs.touch("F016", "feature/F016", "review").unwrap();
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(second.last_action, "review");
        assert!(dir.path().join("F016-feature-F016.json").exists());
    }

    #[test]
    fn test_list_for_filters_by_feature() {
        let dir = tempdir().unwrap();
        let runs = RunsDir::new(dir.path());
        runs.touch("F016", "a", "build").unwrap();
        runs.touch("F016", "b", "review").unwrap();
        runs.touch("F017", "a", "build").unwrap();
        let listed = runs.list_for("F016").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].branch, "b");
    }

    #[test]
    fn test_invalid_feature_rejected() {
        let dir = tempdir().unwrap();
        let runs = RunsDir::new(dir.path());
        assert!(runs.touch("../F016", "main", "x").is_err());
        assert!(runs.load("F016", "main").unwrap().is_none());
    }
}
