// Run State
// Durable records for a pipeline run: statuses, per-stage executions, and the
// artifacts summary. Persisted as a single JSON document per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{PipelineConfig, TriggerKind};
use crate::runtime::TokenUsage;
use crate::value::ExtractedData;

/// Name of the synthetic stage inserted by context reduction.
pub const CONTEXT_REDUCER_STAGE: &str = "__context_reducer__";

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Status of one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for dependencies.
    Pending,
    /// Agent invocation in flight.
    Running,
    Success,
    Failed,
    /// Condition evaluated false or a dependency failed; never ran.
    Skipped,
    /// Run-wide cancellation interrupted the stage.
    Cancelled,
}

impl StageStatus {
    /// Terminal states never revert within an attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Success | StageStatus::Failed | StageStatus::Skipped | StageStatus::Cancelled
        )
    }

    /// Whether dependents may start once this stage carries the status.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Skipped)
    }
}

/// What started the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerInfo {
    pub fn manual() -> Self {
        Self {
            kind: TriggerKind::Manual,
            commit_sha: None,
            timestamp: Utc::now(),
        }
    }

    pub fn post_commit(commit_sha: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::PostCommit,
            commit_sha: Some(commit_sha.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Terminal failure details for a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

/// One stage's execution record. The scheduler is the only writer; retries
/// reopen the same record under the next attempt number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    pub stage_name: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "ExtractedData::is_empty")]
    pub extracted_data: ExtractedData,
    #[serde(default)]
    pub agent_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    /// 1-based attempt counter; strictly increasing across retries.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Unknown fields survive a load/save round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_attempt() -> u32 {
    1
}

impl StageExecution {
    pub fn pending(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: 0,
            commit_sha: None,
            extracted_data: ExtractedData::new(),
            agent_output: String::new(),
            token_usage: None,
            error: None,
            attempt: 1,
            extra: Map::new(),
        }
    }

    /// Whether the stage actually ran (consumed a runtime invocation).
    pub fn ran(&self) -> bool {
        self.start_time.is_some()
    }
}

/// Run-level artifacts summary, finalized on termination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_commit: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub total_duration_ms: u64,
}

/// The durable record of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub run_id: String,
    /// Snapshot of the configuration the run executed with.
    pub pipeline_config: PipelineConfig,
    pub trigger: TriggerInfo,
    pub status: RunStatus,
    pub stages: Vec<StageExecution>,
    #[serde(default)]
    pub artifacts: RunArtifacts,
    /// Unknown fields survive a load/save round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipelineState {
    /// A fresh running record. Stage records are appended as stages are
    /// gated, started, and settled, so the list always reflects work that
    /// actually entered the scheduler.
    pub fn new(run_id: impl Into<String>, config: PipelineConfig, trigger: TriggerInfo) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_config: config,
            trigger,
            status: RunStatus::Running,
            stages: Vec::new(),
            artifacts: RunArtifacts::default(),
            extra: Map::new(),
        }
    }

    /// Replace the record with the same stage name, or append.
    pub fn upsert_stage(&mut self, record: StageExecution) {
        match self
            .stages
            .iter_mut()
            .find(|s| s.stage_name == record.stage_name)
        {
            Some(existing) => *existing = record,
            None => self.stages.push(record),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.stage_name == name)
    }

    /// Sum of durations over stages that ran.
    pub fn total_stage_duration_ms(&self) -> u64 {
        self.stages
            .iter()
            .filter(|s| s.ran())
            .map(|s| s.duration_ms)
            .sum()
    }

    /// Sum of total token usage across stages that report it.
    pub fn total_tokens(&self) -> u64 {
        self.stages
            .iter()
            .filter_map(|s| s.token_usage.as_ref())
            .map(|u| u.total_tokens)
            .sum()
    }

    pub fn counts(&self) -> StageCounts {
        let mut counts = StageCounts::default();
        for stage in &self.stages {
            match stage.status {
                StageStatus::Pending => counts.pending += 1,
                StageStatus::Running => counts.running += 1,
                StageStatus::Success => counts.succeeded += 1,
                StageStatus::Failed => counts.failed += 1,
                StageStatus::Skipped => counts.skipped += 1,
                StageStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts.total = self.stages.len();
        counts
    }
}

/// Per-status stage tally for summaries.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    fn config_with_stages(names: &[&str]) -> PipelineConfig {
        PipelineConfig {
            name: "demo".to_string(),
            trigger: TriggerKind::Manual,
            agents: names
                .iter()
                .map(|name| StageConfig {
                    name: name.to_string(),
                    agent: "agents/demo.md".into(),
                    depends_on: Vec::new(),
                    timeout_seconds: None,
                    retry: Default::default(),
                    on_fail: None,
                    outputs: Vec::new(),
                    condition: None,
                    runtime: None,
                })
                .collect(),
            settings: Default::default(),
            runtime: None,
            git: Default::default(),
        }
    }

    #[test]
    fn new_state_starts_running_with_no_stage_records() {
        let state = PipelineState::new("run-1", config_with_stages(&["a", "b"]), TriggerInfo::manual());
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.stages.is_empty());
    }

    #[test]
    fn upsert_replaces_by_name() {
        let mut state =
            PipelineState::new("run-1", config_with_stages(&["a"]), TriggerInfo::manual());
        state.upsert_stage(StageExecution::pending("a"));
        let mut done = StageExecution::pending("a");
        done.status = StageStatus::Success;
        done.attempt = 2;
        state.upsert_stage(done);
        assert_eq!(state.stages.len(), 1);
        assert_eq!(state.stages[0].status, StageStatus::Success);
        assert_eq!(state.stages[0].attempt, 2);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let mut state =
            PipelineState::new("run-2", config_with_stages(&["a"]), TriggerInfo::manual());
        state.extra.insert(
            "reporterHints".to_string(),
            serde_json::json!({ "channel": "#ops" }),
        );
        let text = serde_json::to_string(&state).unwrap();
        let reloaded: PipelineState = serde_json::from_str(&text).unwrap();
        assert_eq!(
            reloaded.extra.get("reporterHints"),
            state.extra.get("reporterHints")
        );
    }

    #[test]
    fn total_duration_counts_only_ran_stages() {
        let mut state =
            PipelineState::new("run-3", config_with_stages(&["a", "b"]), TriggerInfo::manual());
        let mut ran = StageExecution::pending("a");
        ran.start_time = Some(Utc::now());
        ran.duration_ms = 1200;
        let mut skipped = StageExecution::pending("b");
        skipped.status = StageStatus::Skipped;
        skipped.duration_ms = 900; // never started
        state.upsert_stage(ran);
        state.upsert_stage(skipped);
        assert_eq!(state.total_stage_duration_ms(), 1200);
    }

    #[test]
    fn terminal_statuses() {
        assert!(StageStatus::Success.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Skipped.satisfies_dependents());
        assert!(!StageStatus::Failed.satisfies_dependents());
    }
}
