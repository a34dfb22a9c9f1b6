// Pipeline Configuration
// Declarative description of a pipeline: stages, retry policy, git settings,
// and runtime selection. Loaded from YAML by cadence-core.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What caused a pipeline run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    #[default]
    Manual,
    PostCommit,
}

/// Disposition when a stage (or the run) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Cancel remaining work and fail the run.
    #[default]
    Stop,
    /// Keep going; the run can still complete.
    Continue,
    /// Keep going; the run is reported failed at the end.
    Warn,
}

/// Permission posture handed to the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

/// Retry backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Per-stage retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts in seconds.
    #[serde(default)]
    pub delay_seconds: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_seconds: 0,
            backoff: BackoffKind::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        match self.backoff {
            BackoffKind::Fixed => self.delay_seconds,
            BackoffKind::Exponential => {
                self.delay_seconds
                    .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            }
        }
    }
}

/// How the agent-file body combines with the runtime's own system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptMode {
    Replace,
    #[default]
    Append,
}

/// Knobs forwarded to the selected agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default)]
    pub no_tools: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_mode: Option<SystemPromptMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl RuntimeOptions {
    /// Merge stage-level options over pipeline-level options. Scalar fields
    /// set at the stage level win; list fields are taken wholesale when the
    /// stage provides any entries.
    pub fn merged(base: &RuntimeOptions, overlay: &RuntimeOptions) -> RuntimeOptions {
        RuntimeOptions {
            model: overlay.model.clone().or_else(|| base.model.clone()),
            permission_mode: overlay.permission_mode.or(base.permission_mode),
            max_turns: overlay.max_turns.or(base.max_turns),
            thinking: overlay.thinking.or(base.thinking),
            tools: if overlay.tools.is_empty() {
                base.tools.clone()
            } else {
                overlay.tools.clone()
            },
            no_tools: overlay.no_tools || base.no_tools,
            system_prompt_mode: overlay.system_prompt_mode.or(base.system_prompt_mode),
            api_key: overlay.api_key.clone().or_else(|| base.api_key.clone()),
            api_key_env: overlay
                .api_key_env
                .clone()
                .or_else(|| base.api_key_env.clone()),
            provider: overlay.provider.clone().or_else(|| base.provider.clone()),
            args: if overlay.args.is_empty() {
                base.args.clone()
            } else {
                overlay.args.clone()
            },
        }
    }
}

/// Runtime selection plus its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Registry key of the transport ("headless", "api", ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: RuntimeOptions,
}

/// One agent invocation within the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    /// Unique stage name within the pipeline.
    pub name: String,
    /// Path to the agent instructions file, relative to the repository root.
    pub agent: PathBuf,
    /// Names of stages that must finish before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Overrides the run-wide failure strategy for this stage only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<FailureAction>,
    /// Output keys the extractor should look for in the agent's response.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Expression over prior stage outputs gating execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
}

/// Context-reduction thresholds. Reduction fires once the summed token usage
/// crosses `trigger_threshold` (default: 90% of `max_tokens`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextReductionSettings {
    #[serde(default)]
    pub enabled: bool,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_threshold: Option<u64>,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Optional instructions file for the reducer agent; a built-in prompt is
    /// used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<PathBuf>,
}

fn default_context_window() -> usize {
    3
}

impl ContextReductionSettings {
    pub fn effective_threshold(&self) -> u64 {
        self.trigger_threshold
            .unwrap_or_else(|| (self.max_tokens as f64 * 0.9) as u64)
    }
}

/// Run-wide behavioural settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    /// Commit subject template; must contain the `{{stage}}` placeholder.
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    #[serde(default)]
    pub failure_strategy: FailureAction,
    /// Keep the run branch checked out after the run finishes.
    #[serde(default)]
    pub preserve_working_tree: bool,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_reduction: Option<ContextReductionSettings>,
}

fn default_true() -> bool {
    true
}

fn default_commit_prefix() -> String {
    "cadence({{stage}})".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            auto_commit: true,
            commit_prefix: default_commit_prefix(),
            failure_strategy: FailureAction::Stop,
            preserve_working_tree: false,
            permission_mode: PermissionMode::Default,
            context_reduction: None,
        }
    }
}

/// Branch lifecycle policy for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStrategy {
    /// One long-lived branch per pipeline, reused across runs.
    #[default]
    Reusable,
    /// A fresh branch per run, keyed by a short run id.
    UniquePerRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSettings {
    #[serde(default)]
    pub auto_create: bool,
}

/// Git integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSettings {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub strategy: BranchStrategy,
    #[serde(default)]
    pub pull_request: PullRequestSettings,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "cadence".to_string()
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            branch_prefix: default_branch_prefix(),
            strategy: BranchStrategy::Reusable,
            pull_request: PullRequestSettings::default(),
        }
    }
}

/// A complete pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    pub agents: Vec<StageConfig>,
    #[serde(default)]
    pub settings: PipelineSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub git: GitSettings,
}

impl PipelineConfig {
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.agents.iter().find(|s| s.name == name)
    }

    /// Runtime options for a stage: pipeline-level options with the stage's
    /// overlay applied.
    pub fn runtime_options_for(&self, stage: &StageConfig) -> RuntimeOptions {
        let base = self
            .runtime
            .as_ref()
            .map(|r| r.options.clone())
            .unwrap_or_default();
        match &stage.runtime {
            Some(overlay) => RuntimeOptions::merged(&base, &overlay.options),
            None => base,
        }
    }

    /// Runtime kind requested for a stage, if any override is present.
    pub fn runtime_kind_for<'a>(&'a self, stage: &'a StageConfig) -> Option<&'a str> {
        stage
            .runtime
            .as_ref()
            .or(self.runtime.as_ref())
            .map(|r| r.kind.as_str())
    }
}
