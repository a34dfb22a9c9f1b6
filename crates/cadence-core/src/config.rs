// Pipeline Config Loading
// YAML pipeline definitions and agent instruction files.

use std::path::{Path, PathBuf};

use cadence_types::PipelineConfig;

use crate::error::{PipelineError, Result};
use crate::paths;

/// Load a pipeline definition from a YAML file.
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_yaml::from_str(&content)
        .map_err(|e| PipelineError::Parse(format!("Invalid pipeline {}: {}", path.display(), e)))
}

/// Resolve a pipeline by name under `.cadence/pipelines/`.
pub fn find_pipeline(repo: &Path, name: &str) -> Result<PathBuf> {
    let dir = paths::pipelines_dir(repo);
    for ext in ["yaml", "yml"] {
        let candidate = dir.join(format!("{name}.{ext}"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(PipelineError::NotFound(format!(
        "pipeline '{}' not found under {}",
        name,
        dir.display()
    )))
}

/// Load an agent instructions file (UTF-8, whole file). Relative paths are
/// resolved against the repository root.
pub fn load_agent_file(repo: &Path, agent: &Path) -> Result<String> {
    let path = if agent.is_absolute() {
        agent.to_path_buf()
    } else {
        repo.join(agent)
    };
    std::fs::read_to_string(&path).map_err(|e| {
        PipelineError::Io(format!("Failed to read agent file {}: {}", path.display(), e))
    })
}
