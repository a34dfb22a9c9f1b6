// Stage Scheduler
// Drives the compiled plan level by level: dependency and condition gating,
// concurrent stage tasks, per-stage deadlines and retries, failure policy,
// context reduction, and run-wide cancellation. State is checkpointed on the
// scheduler's sequential path after every transition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use cadence_runtime::{
    AgentRequest, ProgressSink, ProgressUpdate, RuntimeError, RuntimeRegistry,
};
use cadence_types::{
    FailureAction, PipelineConfig, PipelineState, RunStatus, StageConfig, StageError,
    StageExecution, StageStatus,
};

use crate::branch::BranchCoordinator;
use crate::condition::evaluate_condition;
use crate::config::load_agent_file;
use crate::error::Result;
use crate::planner::ExecutionGraph;
use crate::prompt::build_stage_prompt;
use crate::reducer::ContextReducer;

/// Commit seam the scheduler uses for autocommit. The branch coordinator is
/// the production implementation.
#[async_trait]
pub trait ChangeCommitter: Send + Sync {
    /// Stage and commit the working tree; `None` when there was nothing to
    /// commit.
    async fn commit_stage(&self, message: &str) -> Result<Option<String>>;
}

#[async_trait]
impl ChangeCommitter for BranchCoordinator {
    async fn commit_stage(&self, message: &str) -> Result<Option<String>> {
        self.commit(message, None).await
    }
}

/// Invoked after every state transition; implementations persist and log,
/// they never fail the run.
pub type CheckpointFn = Arc<dyn Fn(&PipelineState) + Send + Sync>;

/// Per-stage progress: stage name plus the runtime's update.
pub type StageProgress = Arc<dyn Fn(&str, ProgressUpdate) + Send + Sync>;

pub struct StageScheduler {
    repo: PathBuf,
    registry: Arc<RuntimeRegistry>,
    committer: Option<Arc<dyn ChangeCommitter>>,
    reducer: Option<ContextReducer>,
    checkpoint: CheckpointFn,
    progress: Option<StageProgress>,
}

impl StageScheduler {
    pub fn new(repo: impl Into<PathBuf>, registry: Arc<RuntimeRegistry>) -> Self {
        Self {
            repo: repo.into(),
            registry,
            committer: None,
            reducer: None,
            checkpoint: Arc::new(|_| {}),
            progress: None,
        }
    }

    pub fn with_committer(mut self, committer: Arc<dyn ChangeCommitter>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn with_reducer(mut self, reducer: ContextReducer) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointFn) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_progress(mut self, progress: StageProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Walk the plan. The final run status lands in `state.status`; stage
    /// failures are recorded, never bubbled.
    pub async fn execute(
        &self,
        state: &mut PipelineState,
        plan: &ExecutionGraph,
        cancel: CancellationToken,
    ) -> Result<()> {
        let config = Arc::new(state.pipeline_config.clone());
        let run_id_short = state.run_id.chars().take(8).collect::<String>();
        // Complete dispositions for gating; context reduction rewrites
        // `state.stages` but never this ledger.
        let mut ledger: Vec<StageExecution> = Vec::new();
        let mut stopped = false;

        'levels: for (level_index, group) in plan.level_groups.iter().enumerate() {
            if cancel.is_cancelled() {
                break 'levels;
            }

            // Gate in declaration order: failed dependencies and false
            // conditions settle a stage without a runtime invocation.
            let mut runnable: Vec<StageConfig> = Vec::new();
            for name in group {
                let Some(stage_cfg) = config.stage(name).cloned() else {
                    continue;
                };
                if let Some(reason) = unsatisfied_dependency(&stage_cfg, &ledger) {
                    let record = skipped_record(name, Some(StageError::new(reason)));
                    ledger.push(record.clone());
                    state.upsert_stage(record);
                    (self.checkpoint)(state);
                    continue;
                }
                if let Some(expr) = &stage_cfg.condition {
                    if !evaluate_condition(expr, &ledger) {
                        tracing::info!("stage '{}' skipped: condition not met", name);
                        let record = skipped_record(name, None);
                        ledger.push(record.clone());
                        state.upsert_stage(record);
                        (self.checkpoint)(state);
                        continue;
                    }
                }
                runnable.push(stage_cfg);
            }

            // Launch the level. Siblings share a level token so a stop-policy
            // failure cancels stages still in flight.
            let level_cancel = cancel.child_token();
            let history = Arc::new(state.stages.clone());
            let mut join = JoinSet::new();
            for stage_cfg in runnable {
                let mut running = StageExecution::pending(&stage_cfg.name);
                running.status = StageStatus::Running;
                running.start_time = Some(Utc::now());
                state.upsert_stage(running);
                (self.checkpoint)(state);

                let spec = StageTaskSpec {
                    repo: self.repo.clone(),
                    config: config.clone(),
                    stage: stage_cfg,
                    history: history.clone(),
                    registry: self.registry.clone(),
                    committer: self.committer.clone(),
                    run_id_short: run_id_short.clone(),
                    progress: self.progress.clone(),
                    cancel: level_cancel.child_token(),
                };
                join.spawn(run_stage(spec));
            }

            // Barrier: every stage at this level settles before the next
            // level starts. Checkpoints happen here, on the sequential path.
            while let Some(joined) = join.join_next().await {
                let record = match joined {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::error!("stage task join failed: {}", e);
                        continue;
                    }
                };

                if record.status == StageStatus::Failed {
                    match effective_action(&config, &record.stage_name) {
                        FailureAction::Stop => {
                            stopped = true;
                            level_cancel.cancel();
                        }
                        FailureAction::Warn => {
                            tracing::warn!(
                                "stage '{}' failed; continuing (run will be reported failed)",
                                record.stage_name
                            );
                        }
                        FailureAction::Continue => {
                            tracing::info!(
                                "stage '{}' failed; continuing per policy",
                                record.stage_name
                            );
                        }
                    }
                }

                ledger.push(record.clone());
                state.upsert_stage(record);
                (self.checkpoint)(state);
            }

            if stopped || cancel.is_cancelled() {
                break 'levels;
            }

            // Consult the reducer before the next level.
            if level_index + 1 < plan.level_groups.len() {
                if let Some(reducer) = &self.reducer {
                    let total = state.total_tokens();
                    if reducer.should_reduce(total) {
                        if let Some(reduced) =
                            reducer.reduce(&state.stages, cancel.child_token()).await
                        {
                            state.stages = reduced;
                            (self.checkpoint)(state);
                        }
                    }
                }
            }
        }

        // Stages the run never reached settle as cancelled.
        for stage_cfg in &config.agents {
            if !ledger.iter().any(|s| s.stage_name == stage_cfg.name) {
                let mut record = StageExecution::pending(&stage_cfg.name);
                record.status = StageStatus::Cancelled;
                record.error = Some(StageError::new("run ended before stage started"));
                ledger.push(record.clone());
                state.upsert_stage(record);
            }
        }

        state.status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if run_failed(&config, &ledger) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        (self.checkpoint)(state);
        Ok(())
    }
}

/// Per-stage disposition on failure: the stage override wins, the run-wide
/// strategy otherwise.
fn effective_action(config: &PipelineConfig, stage_name: &str) -> FailureAction {
    config
        .stage(stage_name)
        .and_then(|s| s.on_fail)
        .unwrap_or(config.settings.failure_strategy)
}

/// The run fails unless every failed stage was under an effective `continue`.
fn run_failed(config: &PipelineConfig, ledger: &[StageExecution]) -> bool {
    ledger.iter().any(|record| {
        record.status == StageStatus::Failed
            && effective_action(config, &record.stage_name) != FailureAction::Continue
    }) || ledger
        .iter()
        .any(|record| record.status == StageStatus::Cancelled)
}

fn unsatisfied_dependency(stage: &StageConfig, ledger: &[StageExecution]) -> Option<String> {
    for dep in &stage.depends_on {
        match ledger.iter().find(|s| s.stage_name == *dep) {
            Some(record) if record.status.satisfies_dependents() => {}
            Some(record) => {
                return Some(format!(
                    "dependency '{}' ended {:?}",
                    dep, record.status
                ))
            }
            None => return Some(format!("dependency '{}' did not run", dep)),
        }
    }
    None
}

fn skipped_record(name: &str, error: Option<StageError>) -> StageExecution {
    let mut record = StageExecution::pending(name);
    record.status = StageStatus::Skipped;
    record.error = error;
    record
}

/// Commit subject: prefix with `{{stage}}` substituted, the short run id,
/// and the first line of the agent's response.
fn commit_message(prefix: &str, stage: &str, run_id_short: &str, agent_output: &str) -> String {
    let subject = prefix.replace("{{stage}}", stage);
    let first_line = agent_output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("update");
    let first_line: String = first_line.chars().take(72).collect();
    format!("{subject} {run_id_short}: {first_line}")
}

struct StageTaskSpec {
    repo: PathBuf,
    config: Arc<PipelineConfig>,
    stage: StageConfig,
    history: Arc<Vec<StageExecution>>,
    registry: Arc<RuntimeRegistry>,
    committer: Option<Arc<dyn ChangeCommitter>>,
    run_id_short: String,
    progress: Option<StageProgress>,
    cancel: CancellationToken,
}

enum AttemptError {
    Timeout(u64),
    Runtime(RuntimeError),
}

/// A stage task never propagates a panic into the scheduler; it settles the
/// record instead.
async fn run_stage(spec: StageTaskSpec) -> StageExecution {
    let name = spec.stage.name.clone();
    match std::panic::AssertUnwindSafe(run_stage_inner(spec))
        .catch_unwind()
        .await
    {
        Ok(record) => record,
        Err(_) => {
            tracing::error!("stage '{}' panicked", name);
            let mut record = StageExecution::pending(&name);
            record.status = StageStatus::Failed;
            record.end_time = Some(Utc::now());
            record.error = Some(StageError::new("stage task panicked"));
            record
        }
    }
}

async fn run_stage_inner(spec: StageTaskSpec) -> StageExecution {
    let timer = Instant::now();
    let mut record = StageExecution::pending(&spec.stage.name);
    record.status = StageStatus::Running;
    record.start_time = Some(Utc::now());

    let system_prompt = match load_agent_file(&spec.repo, &spec.stage.agent) {
        Ok(body) => body,
        Err(e) => {
            return settle(
                record,
                timer,
                StageStatus::Failed,
                Some(StageError::with_suggestion(
                    e.to_string(),
                    "check the stage's agent path in the pipeline definition",
                )),
            );
        }
    };
    let user_prompt = build_stage_prompt(&spec.config, &spec.stage, &spec.history);
    let options = spec.config.runtime_options_for(&spec.stage);

    let requested = spec.config.runtime_kind_for(&spec.stage);
    let Some((runtime, fallback)) = spec.registry.select(requested) else {
        return settle(
            record,
            timer,
            StageStatus::Failed,
            Some(StageError::new("no agent runtimes registered")),
        );
    };
    if fallback {
        tracing::warn!(
            "runtime '{}' unavailable for stage '{}'; falling back to '{}'",
            requested.unwrap_or_default(),
            spec.stage.name,
            runtime.name()
        );
    }

    let sink: Option<ProgressSink> = spec.progress.clone().map(|progress| {
        let stage_name = spec.stage.name.clone();
        Arc::new(move |update: ProgressUpdate| progress(&stage_name, update)) as ProgressSink
    });

    let max_attempts = spec.stage.retry.max_attempts.max(1);
    loop {
        let request = AgentRequest {
            system_prompt: system_prompt.clone(),
            user_prompt: user_prompt.clone(),
            output_keys: spec.stage.outputs.clone(),
            options: options.clone(),
            working_dir: spec.repo.clone(),
        };

        let attempt_cancel = spec.cancel.child_token();
        let exec = runtime.execute(request, sink.clone(), attempt_cancel.clone());
        let attempt_result = match spec.stage.timeout_seconds {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs(seconds), exec).await {
                    Ok(inner) => inner.map_err(AttemptError::Runtime),
                    Err(_) => {
                        // the dropped future tears the invocation down
                        attempt_cancel.cancel();
                        Err(AttemptError::Timeout(seconds))
                    }
                }
            }
            None => exec.await.map_err(AttemptError::Runtime),
        };

        match attempt_result {
            Ok(outcome) => {
                record.agent_output = outcome.text_output;
                record.extracted_data = outcome.extracted_data;
                record.token_usage = outcome.token_usage;
                let mut record = settle(record, timer, StageStatus::Success, None);

                if spec.config.settings.auto_commit {
                    if let Some(committer) = &spec.committer {
                        let message = commit_message(
                            &spec.config.settings.commit_prefix,
                            &spec.stage.name,
                            &spec.run_id_short,
                            &record.agent_output,
                        );
                        match committer.commit_stage(&message).await {
                            Ok(sha) => record.commit_sha = sha,
                            Err(e) => tracing::warn!(
                                "autocommit for stage '{}' failed: {}",
                                spec.stage.name,
                                e
                            ),
                        }
                    }
                }
                return record;
            }
            Err(AttemptError::Runtime(RuntimeError::Cancelled)) => {
                return settle(
                    record,
                    timer,
                    StageStatus::Cancelled,
                    Some(StageError::new("stage cancelled")),
                );
            }
            Err(err) => {
                if spec.cancel.is_cancelled() {
                    return settle(
                        record,
                        timer,
                        StageStatus::Cancelled,
                        Some(StageError::new("stage cancelled")),
                    );
                }

                let message = match &err {
                    AttemptError::Timeout(seconds) => format!("timeout after {seconds}s"),
                    AttemptError::Runtime(e) => e.to_string(),
                };

                if record.attempt < max_attempts {
                    tracing::warn!(
                        "stage '{}' attempt {}/{} failed: {}; retrying",
                        spec.stage.name,
                        record.attempt,
                        max_attempts,
                        message
                    );
                    let delay = spec.stage.retry.delay_for_attempt(record.attempt);
                    if delay > 0 {
                        tokio::select! {
                            _ = spec.cancel.cancelled() => {
                                return settle(
                                    record,
                                    timer,
                                    StageStatus::Cancelled,
                                    Some(StageError::new("stage cancelled")),
                                );
                            }
                            _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                        }
                    }
                    record.attempt += 1;
                    continue;
                }

                let error = match err {
                    AttemptError::Timeout(_) => StageError::with_suggestion(
                        message,
                        "increase timeoutSeconds or reduce the stage's scope",
                    ),
                    AttemptError::Runtime(_) => StageError::new(message),
                };
                return settle(record, timer, StageStatus::Failed, Some(error));
            }
        }
    }
}

fn settle(
    mut record: StageExecution,
    timer: Instant,
    status: StageStatus,
    error: Option<StageError>,
) -> StageExecution {
    record.status = status;
    record.error = error;
    record.end_time = Some(Utc::now());
    record.duration_ms = timer.elapsed().as_millis() as u64;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use crate::reducer::DEFAULT_REDUCER_PROMPT;
    use crate::testing::{pipeline, stage, write_agent_files, MockResponse, MockRuntime};
    use cadence_types::{
        ContextReductionSettings, PipelineState, RetryPolicy, TriggerInfo, CONTEXT_REDUCER_STAGE,
    };

    struct RecordingCommitter {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingCommitter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeCommitter for RecordingCommitter {
        async fn commit_stage(&self, message: &str) -> Result<Option<String>> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(message.to_string());
            Ok(Some(format!("sha{}", messages.len())))
        }
    }

    fn registry_with(mock: Arc<MockRuntime>) -> Arc<RuntimeRegistry> {
        let mut registry = RuntimeRegistry::new();
        registry.register(mock);
        Arc::new(registry)
    }

    fn scheduler(repo: &Path, mock: Arc<MockRuntime>) -> StageScheduler {
        StageScheduler::new(repo, registry_with(mock))
    }

    async fn drive(
        scheduler: &StageScheduler,
        config: cadence_types::PipelineConfig,
        cancel: CancellationToken,
    ) -> PipelineState {
        let plan = ExecutionGraph::build(&config).unwrap();
        let mut state = PipelineState::new("0123456789abcdef", config, TriggerInfo::manual());
        scheduler
            .execute(&mut state, &plan, cancel)
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn single_stage_success_closes_the_run() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script(
            "lint",
            vec![MockResponse::text("All clear\n```json\n{\"issues\": 0}\n```")],
        );

        let mut config = pipeline("review", vec![stage("lint", &[])]);
        config.agents[0].outputs = vec!["issues".to_string()];
        config.settings.auto_commit = true;
        write_agent_files(repo.path(), &config);

        let committer = RecordingCommitter::new();
        let scheduler =
            scheduler(repo.path(), mock.clone()).with_committer(committer.clone());
        let state = drive(&scheduler, config, CancellationToken::new()).await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.stages.len(), 1);
        let lint = &state.stages[0];
        assert_eq!(lint.status, StageStatus::Success);
        assert_eq!(lint.extracted_data.get_i64("issues").unwrap(), 0);
        assert_eq!(lint.commit_sha.as_deref(), Some("sha1"));

        let messages = committer.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("lint"));
        assert!(!messages[0].contains("{{stage}}"));
        assert!(messages[0].contains("01234567"));
        assert!(messages[0].ends_with(": All clear"));
    }

    #[tokio::test]
    async fn dependents_start_after_dependencies_end() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script("a", vec![MockResponse::slow("done", Duration::from_millis(40))]);
        mock.script("b", vec![MockResponse::slow("done", Duration::from_millis(15))]);

        let config = pipeline(
            "fanin",
            vec![stage("a", &[]), stage("b", &[]), stage("c", &["a", "b"])],
        );
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Completed);
        let a = state.stage("a").unwrap();
        let b = state.stage("b").unwrap();
        let c = state.stage("c").unwrap();
        assert!(c.start_time.unwrap() >= a.end_time.unwrap());
        assert!(c.start_time.unwrap() >= b.end_time.unwrap());
    }

    #[tokio::test]
    async fn stop_policy_cancels_the_concurrent_sibling() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script("x", vec![MockResponse::failure("boom")]);
        mock.script("y", vec![MockResponse::slow("late", Duration::from_secs(30))]);

        let config = pipeline("pair", vec![stage("x", &[]), stage("y", &[])]);
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stage("x").unwrap().status, StageStatus::Failed);
        assert_eq!(state.stage("y").unwrap().status, StageStatus::Cancelled);
    }

    #[tokio::test]
    async fn continue_policy_completes_and_skips_dependents_of_failures() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script("x", vec![MockResponse::failure("boom")]);

        let mut config = pipeline(
            "tolerant",
            vec![stage("x", &[]), stage("z", &[]), stage("y", &["x"])],
        );
        config.settings.failure_strategy = FailureAction::Continue;
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        // the run completes, the failed stage's dependent is skipped, and
        // every stage is accounted for
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.stages.len(), 3);
        assert_eq!(state.stage("x").unwrap().status, StageStatus::Failed);
        assert_eq!(state.stage("z").unwrap().status, StageStatus::Success);
        let y = state.stage("y").unwrap();
        assert_eq!(y.status, StageStatus::Skipped);
        assert!(y.error.as_ref().unwrap().message.contains("dependency 'x'"));
        assert_eq!(mock.call_count("y"), 0);
    }

    #[tokio::test]
    async fn warn_policy_continues_but_fails_the_run() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script("x", vec![MockResponse::failure("boom")]);

        let mut config = pipeline("warned", vec![stage("x", &[]), stage("y", &[])]);
        config.settings.failure_strategy = FailureAction::Warn;
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stage("y").unwrap().status, StageStatus::Success);
        assert_eq!(mock.call_count("y"), 1);
    }

    #[tokio::test]
    async fn per_stage_on_fail_overrides_the_run_strategy() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script("x", vec![MockResponse::failure("boom")]);

        // run-wide stop, but the failing stage itself says continue
        let mut config = pipeline(
            "override",
            vec![stage("x", &[]), stage("y", &[]), stage("z", &["y"])],
        );
        config.settings.failure_strategy = FailureAction::Stop;
        config.agents[0].on_fail = Some(FailureAction::Continue);
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.stage("x").unwrap().status, StageStatus::Failed);
        assert_eq!(state.stage("z").unwrap().status, StageStatus::Success);
        assert_eq!(mock.call_count("z"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exhausts_retries_and_records_attempts() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script(
            "slow",
            vec![
                MockResponse::slow("late", Duration::from_secs(5)),
                MockResponse::slow("late", Duration::from_secs(5)),
            ],
        );

        let mut config = pipeline("deadline", vec![stage("slow", &[])]);
        config.agents[0].timeout_seconds = Some(1);
        config.agents[0].retry = RetryPolicy {
            max_attempts: 2,
            delay_seconds: 0,
            backoff: Default::default(),
        };
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Failed);
        let slow = state.stage("slow").unwrap();
        assert_eq!(slow.status, StageStatus::Failed);
        assert_eq!(slow.attempt, 2);
        assert!(slow.error.as_ref().unwrap().message.contains("timeout"));
        assert!(slow.error.as_ref().unwrap().suggestion.is_some());
        assert_eq!(mock.call_count("slow"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeout_attempts_are_counted() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script(
            "slow",
            vec![
                MockResponse::slow("late", Duration::from_secs(5)),
                MockResponse::slow("late", Duration::from_secs(5)),
                MockResponse::slow("late", Duration::from_secs(5)),
            ],
        );

        let mut config = pipeline("deadline", vec![stage("slow", &[])]);
        config.agents[0].timeout_seconds = Some(1);
        config.agents[0].retry = RetryPolicy {
            max_attempts: 3,
            delay_seconds: 1,
            backoff: Default::default(),
        };
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.stage("slow").unwrap().attempt, 3);
        assert_eq!(mock.call_count("slow"), 3);
    }

    #[tokio::test]
    async fn retry_recovers_on_a_later_attempt() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script(
            "flaky",
            vec![
                MockResponse::failure("transient"),
                MockResponse::failure("transient"),
                MockResponse::text("recovered"),
            ],
        );

        let mut config = pipeline("retries", vec![stage("flaky", &[])]);
        config.agents[0].retry = RetryPolicy {
            max_attempts: 3,
            delay_seconds: 0,
            backoff: Default::default(),
        };
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Completed);
        let flaky = state.stage("flaky").unwrap();
        assert_eq!(flaky.status, StageStatus::Success);
        assert_eq!(flaky.attempt, 3);
        assert_eq!(flaky.agent_output, "recovered");
    }

    #[tokio::test]
    async fn false_condition_skips_without_an_invocation() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script("a", vec![MockResponse::text("```json\n{\"count\": 0}\n```")]);

        let mut config = pipeline("gated", vec![stage("a", &[]), stage("b", &["a"])]);
        config.agents[0].outputs = vec!["count".to_string()];
        config.agents[1].condition = Some("{{ stages.a.outputs.count > 0 }}".to_string());
        write_agent_files(repo.path(), &config);

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.stage("b").unwrap().status, StageStatus::Skipped);
        assert_eq!(mock.call_count("b"), 0);
    }

    #[tokio::test]
    async fn user_cancellation_marks_the_run_cancelled() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        mock.script("slow", vec![MockResponse::slow("late", Duration::from_secs(30))]);

        let config = pipeline("abort", vec![stage("slow", &[])]);
        write_agent_files(repo.path(), &config);

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });

        let state = drive(&scheduler(repo.path(), mock), config, cancel).await;

        assert_eq!(state.status, RunStatus::Cancelled);
        assert_eq!(state.stage("slow").unwrap().status, StageStatus::Cancelled);
    }

    #[tokio::test]
    async fn reduction_fires_between_levels() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        for i in 0..8 {
            mock.script(
                &format!("s{i}"),
                vec![MockResponse::text_with_tokens("done", 200)],
            );
        }
        mock.script(
            "You compress pipeline history.",
            vec![MockResponse::text("compressed history")],
        );

        let mut stages: Vec<_> = (0..8).map(|i| stage(&format!("s{i}"), &[])).collect();
        stages.push(stage("final", &["s0"]));
        let mut config = pipeline("wide", stages);
        let reduction = ContextReductionSettings {
            enabled: true,
            max_tokens: 1000,
            trigger_threshold: None,
            context_window: 3,
            agent: None,
        };
        config.settings.context_reduction = Some(reduction.clone());
        write_agent_files(repo.path(), &config);

        let reducer = ContextReducer::new(
            reduction,
            mock.clone(),
            DEFAULT_REDUCER_PROMPT,
            Default::default(),
            repo.path(),
        );
        let scheduler = scheduler(repo.path(), mock.clone()).with_reducer(reducer);
        let state = drive(&scheduler, config, CancellationToken::new()).await;

        assert_eq!(state.status, RunStatus::Completed);
        // visible history: reducer record + last 3 of level 0 + the level-1 stage
        assert_eq!(state.stages.len(), 5);
        assert_eq!(state.stages[0].stage_name, CONTEXT_REDUCER_STAGE);
        assert!(state.stages[0].agent_output.contains("compressed history"));
        assert_eq!(state.stage("final").unwrap().status, StageStatus::Success);
        assert_eq!(mock.call_count("final"), 1);
    }

    #[tokio::test]
    async fn below_threshold_reduction_is_a_no_op() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();

        let mut config = pipeline("narrow", vec![stage("a", &[]), stage("b", &["a"])]);
        let reduction = ContextReductionSettings {
            enabled: true,
            max_tokens: 1_000_000,
            trigger_threshold: None,
            context_window: 3,
            agent: None,
        };
        config.settings.context_reduction = Some(reduction.clone());
        write_agent_files(repo.path(), &config);

        let reducer = ContextReducer::new(
            reduction,
            mock.clone(),
            DEFAULT_REDUCER_PROMPT,
            Default::default(),
            repo.path(),
        );
        let scheduler = scheduler(repo.path(), mock.clone()).with_reducer(reducer);
        let state = drive(&scheduler, config, CancellationToken::new()).await;

        assert_eq!(state.stages.len(), 2);
        assert!(state.stage(CONTEXT_REDUCER_STAGE).is_none());
        assert_eq!(mock.call_count("You compress pipeline history."), 0);
    }

    #[tokio::test]
    async fn missing_agent_file_fails_the_stage_with_a_suggestion() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();

        let config = pipeline("missing", vec![stage("ghost", &[])]);
        // deliberately no agent files written

        let state = drive(
            &scheduler(repo.path(), mock.clone()),
            config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state.status, RunStatus::Failed);
        let ghost = state.stage("ghost").unwrap();
        assert_eq!(ghost.status, StageStatus::Failed);
        assert!(ghost.error.as_ref().unwrap().suggestion.is_some());
        assert_eq!(mock.call_count("ghost"), 0);
    }

    #[tokio::test]
    async fn checkpoints_follow_every_transition() {
        let repo = TempDir::new().unwrap();
        let mock = MockRuntime::new();

        let config = pipeline("tracked", vec![stage("a", &[]), stage("b", &["a"])]);
        write_agent_files(repo.path(), &config);

        let snapshots: Arc<Mutex<Vec<Vec<(String, StageStatus, u32)>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let checkpoint: CheckpointFn = Arc::new(move |state: &PipelineState| {
            sink.lock().unwrap().push(
                state
                    .stages
                    .iter()
                    .map(|s| (s.stage_name.clone(), s.status, s.attempt))
                    .collect(),
            );
        });

        let scheduler = scheduler(repo.path(), mock).with_checkpoint(checkpoint);
        drive(&scheduler, config, CancellationToken::new()).await;

        let snapshots = snapshots.lock().unwrap();
        // running + success per stage, plus the final status write
        assert!(snapshots.len() >= 5);

        // per stage, attempts never decrease and terminal states are final
        for name in ["a", "b"] {
            let mut saw_terminal = false;
            let mut last_attempt = 0;
            for snapshot in snapshots.iter() {
                if let Some((_, status, attempt)) =
                    snapshot.iter().find(|(n, _, _)| n == name)
                {
                    assert!(*attempt >= last_attempt);
                    last_attempt = *attempt;
                    if saw_terminal {
                        assert!(status.is_terminal());
                    }
                    saw_terminal = status.is_terminal();
                }
            }
        }
    }

    #[test]
    fn commit_messages_substitute_the_stage_placeholder() {
        let message = commit_message("cadence({{stage}})", "lint", "01234567", "All clear\nrest");
        assert_eq!(message, "cadence(lint) 01234567: All clear");

        let long = commit_message("ci({{stage}})", "fix", "abcd1234", &"x".repeat(400));
        assert!(long.chars().count() <= "ci(fix) abcd1234: ".len() + 72);
    }

    #[test]
    fn effective_action_prefers_the_stage_override() {
        let mut config = pipeline("policy", vec![stage("a", &[])]);
        config.settings.failure_strategy = FailureAction::Stop;
        assert_eq!(effective_action(&config, "a"), FailureAction::Stop);
        config.agents[0].on_fail = Some(FailureAction::Warn);
        assert_eq!(effective_action(&config, "a"), FailureAction::Warn);
    }
}
