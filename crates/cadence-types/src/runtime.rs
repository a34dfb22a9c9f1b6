// Runtime Records
// Capability and usage records shared between the scheduler and the agent
// runtime implementations.

use serde::{Deserialize, Serialize};

use crate::config::PermissionMode;

/// Token accounting reported by a runtime, when it supports tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Fixed capability record reported by each runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCapabilities {
    pub streaming: bool,
    pub token_tracking: bool,
    pub mcp: bool,
    pub context_reduction: bool,
    #[serde(default)]
    pub available_models: Vec<String>,
    #[serde(default)]
    pub permission_modes: Vec<PermissionMode>,
}
