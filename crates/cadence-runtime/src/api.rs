// Anthropic API Runtime
// In-process transport: one Messages API call per stage invocation. No
// subprocess, no event stream; token usage comes straight from the response.

use std::time::Instant;

use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cadence_types::{PermissionMode, RuntimeCapabilities, TokenUsage};

use crate::extract::extract_outputs;
use crate::{
    AgentOutcome, AgentRequest, AgentRuntime, OutcomeMetadata, ProgressSink, ProgressUpdate,
    Result, RuntimeError,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u64 = 8192;

pub struct AnthropicApiRuntime {
    client: Client,
    base_url: String,
    /// Ambient key captured at construction; per-request options can still
    /// override it.
    ambient_api_key: Option<String>,
}

impl AnthropicApiRuntime {
    pub fn new(base_url: impl Into<String>, ambient_api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            ambient_api_key,
        }
    }

    /// Reads the ambient Anthropic variables once, at construction.
    pub fn from_env() -> Self {
        let ambient = ["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()));
        Self::new(DEFAULT_BASE_URL, ambient)
    }

    fn resolve_key(&self, request: &AgentRequest) -> Option<String> {
        crate::resolve_api_key(&request.options).or_else(|| self.ambient_api_key.clone())
    }
}

#[async_trait::async_trait]
impl AgentRuntime for AnthropicApiRuntime {
    fn name(&self) -> &str {
        "api"
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            streaming: false,
            token_tracking: true,
            mcp: false,
            context_reduction: true,
            available_models: vec![
                "claude-opus-4-5".to_string(),
                "claude-sonnet-4-5".to_string(),
                "claude-haiku-4-5".to_string(),
            ],
            permission_modes: vec![PermissionMode::Default],
        }
    }

    async fn execute(
        &self,
        request: AgentRequest,
        sink: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let started = Instant::now();
        let Some(api_key) = self.resolve_key(&request) else {
            return Err(RuntimeError::Auth(
                "no API key: set apiKey, apiKeyEnv, or ANTHROPIC_API_KEY".to_string(),
            ));
        };

        let model = request
            .options
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL);

        let body = json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "system": request.system_prompt,
            "messages": [{"role": "user", "content": request.user_prompt}],
        });

        let send = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            response = send => response.map_err(|e| RuntimeError::Http(e.to_string()))?,
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RuntimeError::Auth(format!("API rejected credentials ({status})")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Http(format!("{status}: {detail}")));
        }

        let value: serde_json::Value = tokio::select! {
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            value = response.json() => value.map_err(|e| RuntimeError::Http(e.to_string()))?,
        };

        let mut text_output = String::new();
        if let Some(parts) = value["content"].as_array() {
            for part in parts {
                if part["type"].as_str() == Some("text") {
                    if let Some(text) = part["text"].as_str() {
                        text_output.push_str(text);
                    }
                }
            }
        }
        if let Some(sink) = &sink {
            if !text_output.is_empty() {
                sink(ProgressUpdate::Text {
                    snippet: text_output.clone(),
                });
            }
        }

        let token_usage = value.get("usage").map(|usage| {
            TokenUsage::new(
                usage["input_tokens"].as_u64().unwrap_or(0),
                usage["output_tokens"].as_u64().unwrap_or(0),
            )
        });

        let extracted_data = extract_outputs(&text_output, &request.output_keys);

        Ok(AgentOutcome {
            extracted_data,
            token_usage,
            metadata: OutcomeMetadata {
                runtime: self.name().to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
            text_output,
        })
    }
}
