// Test Support
// Scriptable runtime and config builders shared by the scheduler, reducer,
// and executor tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cadence_runtime::{
    extract::extract_outputs, AgentOutcome, AgentRequest, AgentRuntime, OutcomeMetadata,
    ProgressSink, RuntimeError,
};
use cadence_types::{
    PipelineConfig, RuntimeCapabilities, StageConfig, TokenUsage, TriggerKind,
};

/// One scripted response. Responses are keyed by the first line of the
/// request's system prompt (each stage's agent file names its stage).
#[derive(Debug, Clone)]
pub enum MockResponse {
    Success {
        text: String,
        total_tokens: u64,
        delay: Duration,
    },
    Failure {
        message: String,
        delay: Duration,
    },
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        MockResponse::Success {
            text: text.to_string(),
            total_tokens: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn text_with_tokens(text: &str, total_tokens: u64) -> Self {
        MockResponse::Success {
            text: text.to_string(),
            total_tokens,
            delay: Duration::ZERO,
        }
    }

    pub fn slow(text: &str, delay: Duration) -> Self {
        MockResponse::Success {
            text: text.to_string(),
            total_tokens: 0,
            delay,
        }
    }

    pub fn failure(message: &str) -> Self {
        MockResponse::Failure {
            message: message.to_string(),
            delay: Duration::ZERO,
        }
    }
}

/// Scriptable in-process runtime. Unscripted invocations answer `ok`.
#[derive(Default)]
pub struct MockRuntime {
    scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    calls: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, key: &str, responses: Vec<MockResponse>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), responses.into());
    }

    /// Keys of every invocation, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == key).count()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            token_tracking: true,
            context_reduction: true,
            ..Default::default()
        }
    }

    async fn execute(
        &self,
        request: AgentRequest,
        _sink: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, RuntimeError> {
        let key = request
            .system_prompt
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        self.calls.lock().unwrap().push(key.clone());

        let response = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| MockResponse::text("ok"));

        let (text, total_tokens, delay) = match response {
            MockResponse::Success {
                text,
                total_tokens,
                delay,
            } => (text, total_tokens, delay),
            MockResponse::Failure { message, delay } => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                return Err(RuntimeError::Stream(message));
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        let extracted_data = extract_outputs(&text, &request.output_keys);
        Ok(AgentOutcome {
            extracted_data,
            token_usage: (total_tokens > 0).then(|| TokenUsage {
                input_tokens: total_tokens / 2,
                output_tokens: total_tokens - total_tokens / 2,
                total_tokens,
            }),
            metadata: OutcomeMetadata {
                runtime: "mock".to_string(),
                duration_ms: 0,
            },
            text_output: text,
        })
    }
}

/// Minimal stage config; the agent path is filled in by `write_agent_files`.
pub fn stage(name: &str, deps: &[&str]) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        agent: format!(".cadence/agents/{name}.md").into(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        timeout_seconds: None,
        retry: Default::default(),
        on_fail: None,
        outputs: Vec::new(),
        condition: None,
        runtime: None,
    }
}

pub fn pipeline(name: &str, stages: Vec<StageConfig>) -> PipelineConfig {
    let mut config = PipelineConfig {
        name: name.to_string(),
        trigger: TriggerKind::Manual,
        agents: stages,
        settings: Default::default(),
        runtime: None,
        git: Default::default(),
    };
    // keep unit scenarios free of git side effects
    config.settings.auto_commit = false;
    config
}

/// Write one agent file per stage whose first line is the stage name — the
/// key the mock runtime scripts against.
pub fn write_agent_files(repo: &std::path::Path, config: &PipelineConfig) {
    let dir = crate::paths::agents_dir(repo);
    std::fs::create_dir_all(&dir).unwrap();
    for stage in &config.agents {
        std::fs::write(
            repo.join(&stage.agent),
            format!("{}\nDo the work for this stage.\n", stage.name),
        )
        .unwrap();
    }
}
