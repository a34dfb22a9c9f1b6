// Logging Bootstrap
// Console and JSONL file logging for Cadence processes, plus the span that
// ties every log line of a pipeline run to its run id.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Which Cadence process is writing logs; becomes part of the file name.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Cli,
    Runner,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Cli => f.write_str("cli"),
            ProcessKind::Runner => f.write_str("runner"),
        }
    }
}

/// Keeps the non-blocking writer alive and records where logs went. Dropping
/// the handle flushes buffered lines, so hold it for the process lifetime.
pub struct LoggingHandle {
    pub guard: WorkerGuard,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub initialized_at: DateTime<Utc>,
}

/// Install the global subscriber: a compact console layer gated by
/// `RUST_LOG` (default `info`) plus a JSON file layer rotated daily under
/// `logs_dir`. Stale log files past the retention window are removed first.
pub fn init_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<LoggingHandle> {
    fs::create_dir_all(logs_dir)?;

    let file_prefix = format!("cadence-{process}.jsonl");
    let removed = sweep_stale_logs(logs_dir, &file_prefix, retention_days)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, &file_prefix));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(true)
                .with_span_list(false),
        )
        .try_init()
        .ok();

    tracing::debug!(
        dir = %logs_dir.display(),
        removed_stale = removed,
        "file logging ready"
    );

    Ok(LoggingHandle {
        guard,
        logs_dir: logs_dir.to_path_buf(),
        file_prefix,
        initialized_at: Utc::now(),
    })
}

/// Span that stamps every log line emitted while a pipeline run is in
/// flight. Attach with `Instrument::instrument` so the run id survives into
/// the JSONL records.
pub fn run_span(pipeline: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!("pipeline_run", pipeline, run_id)
}

/// Delete rotated log files for this prefix whose last modification is past
/// the retention window. Rotation stamps the file name, but age is judged by
/// mtime so a renamed or copied file never dodges the sweep. Returns how
/// many files were removed; unreadable entries are left alone.
fn sweep_stale_logs(logs_dir: &Path, file_prefix: &str, retention_days: u64) -> anyhow::Result<u64> {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 24 * 60 * 60);

    let stale: Vec<PathBuf> = fs::read_dir(logs_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(file_prefix))
        })
        .filter(|path| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .is_ok_and(|modified| modified < cutoff)
        })
        .collect();

    let mut removed = 0;
    for path in stale {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_kind_names_the_log_file() {
        assert_eq!(format!("cadence-{}.jsonl", ProcessKind::Cli), "cadence-cli.jsonl");
        assert_eq!(
            format!("cadence-{}.jsonl", ProcessKind::Runner),
            "cadence-runner.jsonl"
        );
    }

    #[test]
    fn zero_retention_sweeps_matching_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let rotated = dir.path().join("cadence-cli.jsonl.2026-07-30");
        let unrelated = dir.path().join("notes.txt");
        fs::write(&rotated, "{}\n").unwrap();
        fs::write(&unrelated, "keep me").unwrap();

        let removed = sweep_stale_logs(dir.path(), "cadence-cli.jsonl", 0).unwrap();

        assert_eq!(removed, 1);
        assert!(!rotated.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn fresh_files_survive_a_normal_retention_window() {
        let dir = tempfile::tempdir().unwrap();
        let rotated = dir.path().join("cadence-cli.jsonl.2026-08-01");
        fs::write(&rotated, "{}\n").unwrap();

        let removed = sweep_stale_logs(dir.path(), "cadence-cli.jsonl", 14).unwrap();

        assert_eq!(removed, 0);
        assert!(rotated.exists());
    }

    #[test]
    fn other_processes_logs_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let runner = dir.path().join("cadence-runner.jsonl.2026-07-01");
        fs::write(&runner, "{}\n").unwrap();

        let removed = sweep_stale_logs(dir.path(), "cadence-cli.jsonl", 0).unwrap();

        assert_eq!(removed, 0);
        assert!(runner.exists());
    }
}
