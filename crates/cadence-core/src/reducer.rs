// Context Reducer
// Collapses accumulated stage history into one synthetic record once the
// token budget is crossed. Best-effort: a failed reduction changes nothing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cadence_runtime::{AgentRequest, AgentRuntime};
use cadence_types::{
    ContextReductionSettings, RuntimeOptions, StageExecution, StageStatus, CONTEXT_REDUCER_STAGE,
};

use crate::prompt::build_reduction_prompt;

/// Built-in reducer instructions, used when no reducer agent file is
/// configured.
pub const DEFAULT_REDUCER_PROMPT: &str = "You compress pipeline history.\n\
Condense the stage summaries you are given into the shortest account that\n\
preserves decisions, unresolved problems, and referenced outputs.";

pub struct ContextReducer {
    settings: ContextReductionSettings,
    runtime: Arc<dyn AgentRuntime>,
    system_prompt: String,
    options: RuntimeOptions,
    working_dir: PathBuf,
}

impl ContextReducer {
    pub fn new(
        settings: ContextReductionSettings,
        runtime: Arc<dyn AgentRuntime>,
        system_prompt: impl Into<String>,
        options: RuntimeOptions,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            runtime,
            system_prompt: system_prompt.into(),
            options,
            working_dir: working_dir.into(),
        }
    }

    /// Whether the running token total requires a reduction before the next
    /// level.
    pub fn should_reduce(&self, total_tokens: u64) -> bool {
        self.settings.enabled && total_tokens >= self.settings.effective_threshold()
    }

    /// Collapse `stages` into a reducer record plus the trailing context
    /// window. Returns `None` when the reducer agent fails; callers keep the
    /// original list in that case.
    pub async fn reduce(
        &self,
        stages: &[StageExecution],
        cancel: CancellationToken,
    ) -> Option<Vec<StageExecution>> {
        if stages.is_empty() {
            return None;
        }

        let request = AgentRequest {
            system_prompt: self.system_prompt.clone(),
            user_prompt: build_reduction_prompt(stages),
            output_keys: Vec::new(),
            options: self.options.clone(),
            working_dir: self.working_dir.clone(),
        };

        let started = Instant::now();
        let outcome = match self.runtime.execute(request, None, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("context reduction failed, keeping full history: {}", e);
                return None;
            }
        };

        let now = Utc::now();
        let mut synthetic = StageExecution::pending(CONTEXT_REDUCER_STAGE);
        synthetic.status = StageStatus::Success;
        synthetic.start_time = Some(now);
        synthetic.end_time = Some(now);
        synthetic.duration_ms = started.elapsed().as_millis() as u64;
        synthetic.extracted_data = outcome.extracted_data;
        synthetic.agent_output = outcome.text_output;
        synthetic.token_usage = outcome.token_usage;

        let window = self.settings.context_window.min(stages.len());
        let mut reduced = Vec::with_capacity(window + 1);
        reduced.push(synthetic);
        reduced.extend(stages[stages.len() - window..].iter().cloned());

        tracing::info!(
            "context reduced: {} stages collapsed into reducer + last {}",
            stages.len(),
            window
        );
        Some(reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockResponse, MockRuntime};
    use serde_json::json;

    fn settings(window: usize) -> ContextReductionSettings {
        ContextReductionSettings {
            enabled: true,
            max_tokens: 100_000,
            trigger_threshold: None,
            context_window: window,
            agent: None,
        }
    }

    fn executed(name: &str) -> StageExecution {
        let mut stage = StageExecution::pending(name);
        stage.status = StageStatus::Success;
        stage.agent_output = format!("output of {name}");
        stage.extracted_data.insert("key", json!(name));
        stage
    }

    fn reducer(window: usize, runtime: Arc<MockRuntime>) -> ContextReducer {
        ContextReducer::new(
            settings(window),
            runtime,
            DEFAULT_REDUCER_PROMPT,
            RuntimeOptions::default(),
            ".",
        )
    }

    #[test]
    fn below_threshold_is_a_no_op() {
        let r = reducer(3, MockRuntime::new());
        assert!(!r.should_reduce(89_999));
        assert!(r.should_reduce(90_000));
        assert!(r.should_reduce(150_000));
    }

    #[test]
    fn disabled_settings_never_fire() {
        let mut s = settings(3);
        s.enabled = false;
        let r = ContextReducer::new(
            s,
            MockRuntime::new(),
            DEFAULT_REDUCER_PROMPT,
            RuntimeOptions::default(),
            ".",
        );
        assert!(!r.should_reduce(u64::MAX));
    }

    #[tokio::test]
    async fn collapses_to_reducer_plus_window() {
        let runtime = MockRuntime::new();
        runtime.script(
            "You compress pipeline history.",
            vec![MockResponse::text("history: eight stages, all green")],
        );
        let r = reducer(3, runtime);

        let stages: Vec<StageExecution> =
            (0..8).map(|i| executed(&format!("s{i}"))).collect();
        let reduced = r.reduce(&stages, CancellationToken::new()).await.unwrap();

        assert_eq!(reduced.len(), 4); // reducer + last 3
        assert_eq!(reduced[0].stage_name, CONTEXT_REDUCER_STAGE);
        assert_eq!(reduced[0].status, StageStatus::Success);
        assert!(reduced[0].agent_output.contains("eight stages"));
        let kept: Vec<&str> = reduced[1..].iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(kept, vec!["s5", "s6", "s7"]);
    }

    #[tokio::test]
    async fn fewer_stages_than_window_are_all_kept() {
        let r = reducer(3, MockRuntime::new());
        let stages = vec![executed("a"), executed("b")];
        let reduced = r.reduce(&stages, CancellationToken::new()).await.unwrap();
        assert_eq!(reduced.len(), 3); // reducer + both originals
        assert_eq!(reduced[0].stage_name, CONTEXT_REDUCER_STAGE);
    }

    #[tokio::test]
    async fn reducer_failure_returns_none() {
        let runtime = MockRuntime::new();
        runtime.script(
            "You compress pipeline history.",
            vec![MockResponse::failure("model unavailable")],
        );
        let r = reducer(3, runtime);
        let stages = vec![executed("a"), executed("b")];
        assert!(r.reduce(&stages, CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn existing_records_are_not_mutated() {
        let runtime = MockRuntime::new();
        let r = reducer(2, runtime);
        let stages: Vec<StageExecution> = (0..4).map(|i| executed(&format!("s{i}"))).collect();
        let reduced = r.reduce(&stages, CancellationToken::new()).await.unwrap();
        // originals are untouched and kept records are identical clones
        assert_eq!(stages.len(), 4);
        assert_eq!(reduced[1].agent_output, stages[2].agent_output);
        assert_eq!(reduced[2].agent_output, stages[3].agent_output);
    }
}
