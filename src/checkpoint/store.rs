use super::{Checkpoint, SCHEMA_VERSION, validate_feature_id};
use crate::errors::CheckpointError;
use crate::util::{TMP_SUFFIX, write_json_atomic};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Temp files younger than this may still be mid-write and are never swept.
pub const DEFAULT_TMP_MIN_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for `feature_id`. Validates first.
    pub fn path_for(&self, feature_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_feature_id(feature_id)?;
        Ok(self.dir.join(format!("{}.json", feature_id)))
    }

    pub fn exists(&self, feature_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.path_for(feature_id)?.is_file())
    }

    /// Load the checkpoint for `feature_id`.
    ///
    /// A file that fails to parse is `Corrupt` and is left exactly as found.
    pub fn load(&self, feature_id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(feature_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    feature_id: feature_id.to_string(),
                    path,
                });
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };

        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .map_err(|source| CheckpointError::Corrupt {
                path: path.clone(),
                source,
            })?;

        if checkpoint.schema_version > SCHEMA_VERSION {
            return Err(CheckpointError::UnsupportedSchema {
                path,
                version: checkpoint.schema_version,
            });
        }
        if checkpoint.feature_id != feature_id {
            return Err(CheckpointError::InvalidFeatureId(checkpoint.feature_id));
        }

        tracing::debug!(feature = feature_id, phase = %checkpoint.phase, "loaded checkpoint");
        Ok(checkpoint)
    }

    /// Load, mapping a missing file to `None`.
    pub fn load_optional(&self, feature_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.load(feature_id) {
            Ok(cp) => Ok(Some(cp)),
            Err(CheckpointError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist atomically (temp file + rename).
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.feature_id)?;
        write_json_atomic(&path, checkpoint)
            .map_err(|source| CheckpointError::Io { path: path.clone(), source })?;
        tracing::debug!(
            feature = %checkpoint.feature_id,
            phase = %checkpoint.phase,
            path = %path.display(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Feature ids with a checkpoint on disk, sorted.
    pub fn list(&self) -> Result<Vec<String>, CheckpointError> {
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

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json").map(str::to_string)
            })
            .filter(|id| validate_feature_id(id).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Remove temp files left behind by crashed writers. Only files at least
    /// `min_age` old are touched. Returns how many were removed.
    pub fn sweep_stale_tmp(&self, min_age: Duration) -> Result<usize, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_tmp = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(TMP_SUFFIX));
            if !is_tmp {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "removed stale checkpoint temp file");
                    removed += 1;
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove stale temp file"),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Phase, PhaseResult, advance};
    use crate::workstream::Workstream;
    use tempfile::tempdir;

    fn sample() -> (Checkpoint, Vec<Workstream>) {
        let ws = vec![Workstream::pending("00-016-01"), Workstream::pending("00-016-02")];
        let cp = Checkpoint::create_initial("F016", "feature/F016", &ws);
        (cp, ws)
    }

    #[test]
    fn test_save_then_load_is_deep_equal() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (mut cp, ws) = sample();
        cp.start_workstream("00-016-01", &ws).unwrap();
        advance(&mut cp, PhaseResult::Commit("abc1234".into()), &ws).unwrap();

        store.save(&cp).unwrap();
        let loaded = store.load("F016").unwrap();
        assert_eq!(loaded, cp);
    }

    #[test]
    fn test_invalid_id_fails_before_touching_fs() {
        let dir = tempdir().unwrap();
        let checkpoints = dir.path().join("checkpoints");
        let store = CheckpointStore::new(&checkpoints);
        let (mut cp, _) = sample();
        cp.feature_id = "../escape".into();

        assert!(matches!(store.save(&cp), Err(CheckpointError::InvalidFeatureId(_))));
        assert!(matches!(store.load("../escape"), Err(CheckpointError::InvalidFeatureId(_))));
        assert!(!checkpoints.exists());
    }

    #[test]
    fn test_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(store.load("F016"), Err(CheckpointError::NotFound { .. })));
        assert!(store.load_optional("F016").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_error_and_left_alone() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = dir.path().join("F016.json");
        fs::write(&path, "{\"schema_version\": 1, trunc").unwrap();

        assert!(matches!(store.load("F016"), Err(CheckpointError::Corrupt { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"schema_version\": 1, trunc");
    }

    #[test]
    fn test_newer_schema_refused() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (mut cp, _) = sample();
        cp.schema_version = SCHEMA_VERSION + 1;
        store.save(&cp).unwrap();
        assert!(matches!(
            store.load("F016"),
            Err(CheckpointError::UnsupportedSchema { version, .. }) if version == SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn test_list_ignores_tmp_and_foreign_files() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (cp, _) = sample();
        store.save(&cp).unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();
        fs::write(dir.path().join("F017.json.123.tmp"), "{").unwrap();
        assert_eq!(store.list().unwrap(), vec!["F016".to_string()]);
    }

    #[test]
    fn test_sweep_respects_min_age() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(dir.path().join("F016.json.999.tmp"), "{").unwrap();
        fs::write(dir.path().join("F016.json"), "{}").unwrap();

        assert_eq!(store.sweep_stale_tmp(DEFAULT_TMP_MIN_AGE).unwrap(), 0);
        assert!(dir.path().join("F016.json.999.tmp").exists());

        assert_eq!(store.sweep_stale_tmp(Duration::ZERO).unwrap(), 1);
        assert!(!dir.path().join("F016.json.999.tmp").exists());
        assert!(dir.path().join("F016.json").exists());
    }

    #[test]
    fn test_sweep_on_missing_dir_is_noop() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent"));
        assert_eq!(store.sweep_stale_tmp(Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_phase_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (mut cp, _) = sample();
        cp.phase = Phase::CiLoop;
        cp.pr_number = Some(7);
        store.save(&cp).unwrap();
        let raw = fs::read_to_string(dir.path().join("F016.json")).unwrap();
        assert!(raw.contains("\"ci-loop\""));
        assert_eq!(store.load("F016").unwrap().pr_number, Some(7));
    }
}
