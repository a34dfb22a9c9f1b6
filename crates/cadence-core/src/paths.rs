// Workspace Paths
// Namespaced layout under the repository root. Everything Cadence persists
// lives below `.cadence/`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const CADENCE_DIR: &str = ".cadence";

pub fn cadence_dir(repo: &Path) -> PathBuf {
    repo.join(CADENCE_DIR)
}

pub fn pipelines_dir(repo: &Path) -> PathBuf {
    cadence_dir(repo).join("pipelines")
}

pub fn runs_dir(repo: &Path) -> PathBuf {
    cadence_dir(repo).join("runs")
}

pub fn agents_dir(repo: &Path) -> PathBuf {
    cadence_dir(repo).join("agents")
}

pub fn logs_dir(repo: &Path) -> PathBuf {
    cadence_dir(repo).join("logs")
}

/// Create the full layout; idempotent.
pub fn ensure_layout(repo: &Path) -> Result<()> {
    for dir in [
        pipelines_dir(repo),
        runs_dir(repo),
        agents_dir(repo),
        logs_dir(repo),
    ] {
        fs::create_dir_all(&dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_created_idempotently() {
        let tmp = tempfile::tempdir().unwrap();
        ensure_layout(tmp.path()).unwrap();
        ensure_layout(tmp.path()).unwrap();
        assert!(runs_dir(tmp.path()).is_dir());
        assert!(pipelines_dir(tmp.path()).is_dir());
    }
}
