// Run Store
// Persistence for pipeline run records: one JSON document per run id under
// `.cadence/runs/`, written atomically.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use cadence_types::PipelineState;

use crate::error::{PipelineError, Result};
use crate::paths;

/// Persistence layer for run state.
#[derive(Clone)]
pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    /// Create a store rooted at the repository's runs directory.
    pub fn new(repo: &Path) -> Result<Self> {
        let base_dir = paths::runs_dir(repo);
        fs::create_dir_all(&base_dir)
            .map_err(|e| PipelineError::Persistence(format!("Failed to create runs dir: {}", e)))?;
        Ok(Self { base_dir })
    }

    /// Store rooted at an explicit directory (tests, tooling).
    pub fn at(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| PipelineError::Persistence(format!("Failed to create runs dir: {}", e)))?;
        Ok(Self { base_dir })
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    /// Atomic write: readers see the prior record or the new one, never a
    /// partial file.
    pub fn save(&self, state: &PipelineState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            PipelineError::Serialization(format!("Failed to serialize run state: {}", e))
        })?;
        atomic_write(&self.run_path(&state.run_id), &content)
    }

    pub fn load(&self, run_id: &str) -> Result<PipelineState> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(PipelineError::NotFound(format!("run '{}'", run_id)));
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| PipelineError::Persistence(format!("Failed to read run file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::Parse(format!("Failed to parse run file: {}", e)))
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_path(run_id).exists()
    }

    /// The most recently modified record, if any.
    pub fn latest(&self) -> Result<Option<PipelineState>> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for path in self.record_paths()? {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let replace = match &newest {
                Some((current, _)) => modified > *current,
                None => true,
            };
            if replace {
                newest = Some((modified, path));
            }
        }

        let Some((_, path)) = newest else {
            return Ok(None);
        };
        match read_record(&path) {
            Some(state) => Ok(Some(state)),
            None => Ok(None),
        }
    }

    /// All run records, sorted by trigger timestamp descending. Malformed
    /// documents are skipped with a warning so aggregate queries survive a
    /// single bad file.
    pub fn all(&self) -> Result<Vec<PipelineState>> {
        let mut states: Vec<PipelineState> =
            self.record_paths()?.iter().filter_map(|p| read_record(p)).collect();
        states.sort_by(|a, b| b.trigger.timestamp.cmp(&a.trigger.timestamp));
        Ok(states)
    }

    /// Delete run records whose embedded config name equals `name`.
    pub fn delete_by_pipeline(&self, name: &str) -> Result<usize> {
        let mut deleted = 0;
        for path in self.record_paths()? {
            let Some(state) = read_record(&path) else {
                continue;
            };
            if state.pipeline_config.name == name {
                fs::remove_file(&path).map_err(|e| {
                    PipelineError::Persistence(format!("Failed to delete run record: {}", e))
                })?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let entries = fs::read_dir(&self.base_dir)
            .map_err(|e| PipelineError::Persistence(format!("Failed to read runs dir: {}", e)))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| PipelineError::Persistence(format!("Failed to read entry: {}", e)))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") && path.is_file() {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

fn read_record(path: &Path) -> Option<PipelineState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Skipping unreadable run record {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!("Skipping malformed run record {}: {}", path.display(), e);
            None
        }
    }
}

/// Atomic write using temp file and rename.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)
        .map_err(|e| PipelineError::Persistence(format!("Failed to write temp file: {}", e)))?;

    fs::rename(&temp_path, path)
        .map_err(|e| PipelineError::Persistence(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}
