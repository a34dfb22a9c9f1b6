// Agent Runtime Abstraction
// A runtime is a named transport that executes one agent invocation and
// returns its structured result. The scheduler selects runtimes through the
// registry and never dispatches by name during execution.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cadence_types::{ExtractedData, RuntimeCapabilities, RuntimeOptions, TokenUsage};

pub mod api;
pub mod extract;
pub mod headless;

pub use api::AnthropicApiRuntime;
pub use headless::HeadlessCliRuntime;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Agent-file body (merge mode governed by `options.system_prompt_mode`).
    pub system_prompt: String,
    pub user_prompt: String,
    /// Hints for the output extractor.
    pub output_keys: Vec<String>,
    pub options: RuntimeOptions,
    pub working_dir: PathBuf,
}

/// Progress snippets surfaced while an invocation is in flight.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Text { snippet: String },
    ToolActivity { id: String, tool: String },
}

pub type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OutcomeMetadata {
    pub runtime: String,
    pub duration_ms: u64,
}

/// Structured result of one invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub text_output: String,
    pub extracted_data: ExtractedData,
    pub token_usage: Option<TokenUsage>,
    pub metadata: OutcomeMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("agent process exited with {code:?}: {stderr_tail}")]
    ExitFailure {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("agent event stream error: {0}")]
    Stream(String),

    #[error("agent HTTP error: {0}")]
    Http(String),

    #[error("agent auth error: {0}")]
    Auth(String),

    #[error("agent invocation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// A pluggable transport executing one agent invocation.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> RuntimeCapabilities;

    async fn execute(
        &self,
        request: AgentRequest,
        sink: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome>;
}

/// Name-keyed registry of runtimes. Built once at process start (or per test)
/// and shared behind an `Arc`; registration order decides the default.
#[derive(Default)]
pub struct RuntimeRegistry {
    runtimes: Vec<Arc<dyn AgentRuntime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in transports: the headless agent CLI first
    /// (the preferred default), then the direct API transport.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HeadlessCliRuntime::default()));
        registry.register(Arc::new(AnthropicApiRuntime::from_env()));
        registry
    }

    /// Later registrations with the same name replace earlier ones.
    pub fn register(&mut self, runtime: Arc<dyn AgentRuntime>) {
        self.runtimes.retain(|r| r.name() != runtime.name());
        self.runtimes.push(runtime);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentRuntime>> {
        self.runtimes.iter().find(|r| r.name() == name).cloned()
    }

    pub fn available_types(&self) -> Vec<String> {
        self.runtimes.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn default_runtime(&self) -> Option<Arc<dyn AgentRuntime>> {
        self.runtimes.first().cloned()
    }

    /// Resolve a runtime for `requested`, falling back to the registry
    /// default when the requested type is not registered. Returns the
    /// runtime and whether a fallback was taken.
    pub fn select(&self, requested: Option<&str>) -> Option<(Arc<dyn AgentRuntime>, bool)> {
        match requested {
            Some(name) => match self.get(name) {
                Some(runtime) => Some((runtime, false)),
                None => self.default_runtime().map(|r| (r, true)),
            },
            None => self.default_runtime().map(|r| (r, false)),
        }
    }
}

/// Pure fallback selection: first preferred type present in `available`,
/// else the first available type.
pub fn resolve_runtime(preferred: &[&str], available: &[String]) -> Option<String> {
    preferred
        .iter()
        .find(|p| available.iter().any(|a| a == *p))
        .map(|p| p.to_string())
        .or_else(|| available.first().cloned())
}

/// API-key resolution order: explicit key, the env var named by
/// `api_key_env`, then the ambient Anthropic variables. The environment is
/// read once, when the invocation is being built.
pub fn resolve_api_key(options: &RuntimeOptions) -> Option<String> {
    if let Some(key) = &options.api_key {
        return Some(key.clone());
    }
    if let Some(var) = &options.api_key_env {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                return Some(key);
            }
        }
        return None;
    }
    for var in ["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                return Some(key);
            }
        }
    }
    None
}
