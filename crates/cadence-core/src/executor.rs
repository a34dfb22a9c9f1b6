// Pipeline Executor
// Owns a run's lifecycle: validation, state creation, branch setup, planning,
// scheduling, artifact finalization, and the PR/notification hand-off.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use cadence_observability::run_span;
use cadence_runtime::RuntimeRegistry;
use cadence_types::{
    BranchStrategy, PipelineConfig, PipelineState, RunStatus, TriggerInfo,
};

use crate::branch::BranchCoordinator;
use crate::config::load_agent_file;
use crate::error::{PipelineError, Result};
use crate::notify::{LogNotifier, Notifier, PullRequestCreator};
use crate::paths;
use crate::planner::ExecutionGraph;
use crate::reducer::{ContextReducer, DEFAULT_REDUCER_PROMPT};
use crate::scheduler::{CheckpointFn, StageProgress, StageScheduler};
use crate::store::RunStore;
use crate::validate::{ValidationContext, ValidatorPipeline};

pub struct PipelineExecutor {
    repo: PathBuf,
    store: RunStore,
    registry: Arc<RuntimeRegistry>,
    notifier: Arc<dyn Notifier>,
    pr_creator: Option<Arc<dyn PullRequestCreator>>,
    progress: Option<StageProgress>,
}

impl PipelineExecutor {
    pub fn new(repo: impl Into<PathBuf>, registry: Arc<RuntimeRegistry>) -> Result<Self> {
        let repo = repo.into();
        let store = RunStore::new(&repo)?;
        Ok(Self {
            repo,
            store,
            registry,
            notifier: Arc::new(LogNotifier),
            pr_creator: None,
            progress: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_pr_creator(mut self, creator: Arc<dyn PullRequestCreator>) -> Self {
        self.pr_creator = Some(creator);
        self
    }

    pub fn with_progress(mut self, progress: StageProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Validate and plan without touching git or the store.
    pub fn dry_run(&self, config: &PipelineConfig) -> Result<ExecutionGraph> {
        self.validate(config)?;
        ExecutionGraph::build(config)
    }

    /// Execute a full run. Validation failures abort before any side effect;
    /// the returned state carries the run's final status otherwise.
    pub async fn run(
        &self,
        config: PipelineConfig,
        trigger: TriggerInfo,
        cancel: CancellationToken,
    ) -> Result<PipelineState> {
        self.validate(&config)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let mut state = PipelineState::new(run_id, config.clone(), trigger);
        state.artifacts.handover_dir = Some(paths::runs_dir(&self.repo).display().to_string());
        self.checkpoint(&state);

        let coordinator = Arc::new(BranchCoordinator::new(&self.repo));
        let prepared = match coordinator
            .prepare(&config.name, &state.run_id, &config.git)
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                state.status = RunStatus::Failed;
                self.checkpoint(&state);
                self.notifier.run_failed(&state).await;
                return Err(PipelineError::Setup(e.to_string()));
            }
        };
        tracing::info!(
            branch = %prepared.name,
            created = prepared.created,
            "run branch ready"
        );
        state.artifacts.initial_commit = coordinator.current_commit().await.ok();

        let plan = ExecutionGraph::build(&config)?;

        let mut scheduler = StageScheduler::new(&self.repo, self.registry.clone())
            .with_checkpoint(self.checkpoint_fn());
        if config.settings.auto_commit {
            scheduler = scheduler.with_committer(coordinator.clone());
        }
        if let Some(reducer) = self.build_reducer(&config) {
            scheduler = scheduler.with_reducer(reducer);
        }
        if let Some(progress) = &self.progress {
            scheduler = scheduler.with_progress(progress.clone());
        }

        let span = run_span(&config.name, &state.run_id);
        scheduler
            .execute(&mut state, &plan, cancel)
            .instrument(span)
            .await?;

        state.artifacts.final_commit = coordinator.current_commit().await.ok();
        if let (Some(initial), Some(last)) = (
            state.artifacts.initial_commit.clone(),
            state.artifacts.final_commit.clone(),
        ) {
            if initial != last {
                state.artifacts.changed_files =
                    coordinator.changed_files(&initial, &last).await.unwrap_or_default();
            }
        }
        state.artifacts.total_duration_ms = state.total_stage_duration_ms();
        self.checkpoint(&state);

        if state.status == RunStatus::Completed && config.git.pull_request.auto_create {
            self.create_pull_request(&coordinator, &prepared.name, &state)
                .await;
        }

        if !config.settings.preserve_working_tree {
            // leave the branch behind for `cleanup`, but return the checkout
            // to the base branch
            if let Err(e) = coordinator.checkout(&config.git.base_branch).await {
                tracing::warn!("could not return to '{}': {}", config.git.base_branch, e);
            }
        }

        match state.status {
            RunStatus::Completed => self.notifier.run_completed(&state).await,
            _ => self.notifier.run_failed(&state).await,
        }

        Ok(state)
    }

    fn validate(&self, config: &PipelineConfig) -> Result<()> {
        let ctx = ValidationContext {
            config: config.clone(),
            repo: self.repo.clone(),
            available_runtimes: self.registry.available_types(),
            known_strategies: self.known_strategies(),
        };
        let outcome = ValidatorPipeline::with_defaults().run(&ctx);
        for warning in outcome.warnings() {
            tracing::warn!("{}: {}", warning.field, warning.message);
        }
        if !outcome.is_valid() {
            let details: Vec<String> = outcome
                .errors()
                .map(|issue| format!("{}: {}", issue.field, issue.message))
                .collect();
            return Err(PipelineError::Validation(details.join("; ")));
        }
        Ok(())
    }

    /// Branch strategies already on disk, keyed by pipeline name. The most
    /// recent run wins.
    fn known_strategies(&self) -> HashMap<String, BranchStrategy> {
        let mut strategies = HashMap::new();
        if let Ok(all) = self.store.all() {
            for state in all {
                strategies
                    .entry(state.pipeline_config.name.clone())
                    .or_insert(state.pipeline_config.git.strategy);
            }
        }
        strategies
    }

    fn build_reducer(&self, config: &PipelineConfig) -> Option<ContextReducer> {
        let settings = config.settings.context_reduction.clone()?;
        if !settings.enabled {
            return None;
        }
        let requested = config.runtime.as_ref().map(|r| r.kind.as_str());
        let (runtime, _) = self.registry.select(requested)?;
        let system_prompt = match &settings.agent {
            Some(agent) => match load_agent_file(&self.repo, agent) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("reducer agent file unreadable, using built-in: {}", e);
                    DEFAULT_REDUCER_PROMPT.to_string()
                }
            },
            None => DEFAULT_REDUCER_PROMPT.to_string(),
        };
        let options = config
            .runtime
            .as_ref()
            .map(|r| r.options.clone())
            .unwrap_or_default();
        Some(ContextReducer::new(
            settings,
            runtime,
            system_prompt,
            options,
            self.repo.clone(),
        ))
    }

    async fn create_pull_request(
        &self,
        coordinator: &BranchCoordinator,
        branch: &str,
        state: &PipelineState,
    ) {
        let Some(creator) = &self.pr_creator else {
            tracing::info!("pull request requested but no creator is configured");
            return;
        };
        if let Err(e) = coordinator.push(branch).await {
            tracing::warn!("push before PR failed: {}", e);
            return;
        }
        match creator.create(branch, state).await {
            Ok(url) => self.notifier.pull_request_created(state, &url).await,
            Err(e) => tracing::warn!("pull request creation failed: {}", e),
        }
    }

    fn checkpoint_fn(&self) -> CheckpointFn {
        let store = self.store.clone();
        Arc::new(move |state: &PipelineState| {
            if let Err(e) = store.save(state) {
                tracing::error!("state checkpoint failed: {}", e);
            }
        })
    }

    fn checkpoint(&self, state: &PipelineState) {
        (self.checkpoint_fn())(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    use tempfile::TempDir;
    use tokio::process::Command;

    use crate::testing::{pipeline, stage, write_agent_files, MockResponse, MockRuntime};

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run_git(dir: &TempDir, args: Vec<&str>) {
        let path = dir.path().to_path_buf();
        Command::new("git")
            .args(args)
            .current_dir(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
    }

    async fn init_repo(dir: &TempDir) {
        run_git(dir, vec!["init", "-b", "main"]).await;
        run_git(dir, vec!["config", "user.email", "ci@example.com"]).await;
        run_git(dir, vec!["config", "user.name", "ci"]).await;
        std::fs::write(dir.path().join("README.md"), "seed\n").unwrap();
        run_git(dir, vec!["add", "-A"]).await;
        run_git(dir, vec!["commit", "-m", "seed"]).await;
    }

    fn executor(dir: &TempDir, mock: Arc<MockRuntime>) -> PipelineExecutor {
        let mut registry = RuntimeRegistry::new();
        registry.register(mock);
        PipelineExecutor::new(dir.path(), Arc::new(registry)).unwrap()
    }

    #[tokio::test]
    async fn validation_errors_abort_before_any_side_effect() {
        let dir = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        let executor = executor(&dir, mock.clone());

        // dependency cycle
        let config = pipeline("broken", vec![stage("a", &["b"]), stage("b", &["a"])]);
        let err = executor
            .run(config, TriggerInfo::manual(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(mock.calls().len(), 0);
        // no run record was written
        assert!(executor.store().all().unwrap().is_empty());
        // no branch was created (the repo is not even a git repo)
        assert!(!dir.path().join(".git").exists());
    }

    #[tokio::test]
    async fn dry_run_plans_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        let executor = executor(&dir, mock);

        let config = pipeline(
            "plan-only",
            vec![stage("a", &[]), stage("b", &[]), stage("c", &["a", "b"])],
        );
        write_agent_files(dir.path(), &config);

        let plan = executor.dry_run(&config).unwrap();
        assert_eq!(plan.level_groups.len(), 2);
        assert!(executor.store().all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_run_commits_on_the_run_branch_and_persists_state() {
        if !git_available().await {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;

        let mock = MockRuntime::new();
        mock.script(
            "lint",
            vec![MockResponse::text("All clear\n```json\n{\"issues\": 0}\n```")],
        );
        let executor = executor(&dir, mock);

        let mut config = pipeline("review", vec![stage("lint", &[])]);
        config.agents[0].outputs = vec!["issues".to_string()];
        config.settings.auto_commit = true;
        write_agent_files(dir.path(), &config);
        // commit the agent files so the run starts from a clean tree
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir.path())
            .status()
            .await
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "add pipeline"])
            .current_dir(dir.path())
            .status()
            .await
            .unwrap();

        let state = executor
            .run(config, TriggerInfo::manual(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        let lint = state.stage("lint").unwrap();
        assert_eq!(lint.extracted_data.get_i64("issues").unwrap(), 0);
        assert!(state.artifacts.initial_commit.is_some());
        assert!(state.artifacts.final_commit.is_some());

        // the record landed in the store
        let stored = executor.store().load(&state.run_id).unwrap();
        assert_eq!(stored.status, RunStatus::Completed);

        // the run branch exists
        let coordinator = BranchCoordinator::new(dir.path());
        let branches = coordinator.list_pipeline_branches("cadence").await.unwrap();
        assert_eq!(branches, vec!["cadence/review".to_string()]);
    }

    #[tokio::test]
    async fn setup_failure_marks_the_run_failed() {
        // not a git repository: branch preparation cannot succeed
        let dir = TempDir::new().unwrap();
        let mock = MockRuntime::new();
        let executor = executor(&dir, mock.clone());

        let config = pipeline("review", vec![stage("lint", &[])]);
        write_agent_files(dir.path(), &config);

        let err = executor
            .run(config, TriggerInfo::manual(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Setup(_)));
        assert_eq!(mock.calls().len(), 0);

        let runs = executor.store().all().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }
}
