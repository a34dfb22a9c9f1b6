// Headless CLI Runtime
// Spawns an external agent CLI, pipes the combined prompt over stdin, and
// consumes a line-delimited JSON event stream from stdout.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use cadence_types::{PermissionMode, RuntimeCapabilities, RuntimeOptions, SystemPromptMode};

use crate::extract::extract_outputs;
use crate::{
    AgentOutcome, AgentRequest, AgentRuntime, OutcomeMetadata, ProgressSink, ProgressUpdate,
    Result, RuntimeError,
};

const STDERR_TAIL_LIMIT: usize = 4096;

/// External-CLI transport. The agent binary is expected to accept
/// `-p --mode json --no-session` plus the option-derived flags and to emit
/// one JSON event per stdout line.
pub struct HeadlessCliRuntime {
    program: String,
    grace: Duration,
}

impl Default for HeadlessCliRuntime {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl HeadlessCliRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            grace: Duration::from_secs(2),
        }
    }

    /// Shrink the terminate-to-kill grace window (tests).
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Recognized stdout events. Unknown types are skipped, not errors.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliEvent {
    MessageUpdate {
        #[serde(rename = "assistantMessageEvent")]
        assistant_message_event: AssistantMessageEvent,
    },
    ToolExecutionStart {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        #[allow(dead_code)]
        args: Value,
        id: String,
    },
    AgentEnd,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantMessageEvent {
    TextDelta { delta: String },
    #[serde(other)]
    Unknown,
}

fn parse_event_line(line: &str) -> Option<CliEvent> {
    serde_json::from_str(line).ok()
}

fn permission_mode_flag(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Default => "default",
        PermissionMode::AcceptEdits => "acceptEdits",
        PermissionMode::BypassPermissions => "bypassPermissions",
        PermissionMode::Plan => "plan",
    }
}

/// Argv for one invocation: the fixed headless flags, then option-derived
/// flags, then any passthrough args.
fn build_argv(options: &RuntimeOptions, replace_system: Option<&str>) -> Vec<String> {
    let mut argv = vec![
        "-p".to_string(),
        "--mode".to_string(),
        "json".to_string(),
        "--no-session".to_string(),
    ];

    if let Some(model) = &options.model {
        argv.push("--model".to_string());
        argv.push(model.clone());
    }
    if let Some(mode) = options.permission_mode {
        argv.push("--permission-mode".to_string());
        argv.push(permission_mode_flag(mode).to_string());
    }
    if let Some(max_turns) = options.max_turns {
        argv.push("--max-turns".to_string());
        argv.push(max_turns.to_string());
    }
    if options.thinking == Some(true) {
        argv.push("--thinking".to_string());
    }
    if options.no_tools {
        argv.push("--no-tools".to_string());
    } else {
        for tool in &options.tools {
            argv.push("--tool".to_string());
            argv.push(tool.clone());
        }
    }
    if let Some(system) = replace_system {
        argv.push("--system-prompt".to_string());
        argv.push(system.to_string());
    }
    argv.extend(options.args.iter().cloned());
    argv
}

/// Stdin payload per the prompt-separator convention: under `append` the
/// agent-file body rides in front of the user prompt; under `replace` it went
/// out as `--system-prompt` and only the user prompt is piped.
fn combine_prompt(request: &AgentRequest) -> String {
    match request.options.system_prompt_mode.unwrap_or_default() {
        SystemPromptMode::Append => {
            if request.system_prompt.is_empty() {
                request.user_prompt.clone()
            } else {
                format!("{}\n\n{}", request.system_prompt, request.user_prompt)
            }
        }
        SystemPromptMode::Replace => request.user_prompt.clone(),
    }
}

fn push_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > STDERR_TAIL_LIMIT {
        let cut = tail.len() - STDERR_TAIL_LIMIT;
        // keep the end of the buffer; char boundary safe
        let boundary = (cut..tail.len())
            .find(|i| tail.is_char_boundary(*i))
            .unwrap_or(0);
        tail.drain(..boundary);
    }
}

async fn terminate_then_kill(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[async_trait::async_trait]
impl AgentRuntime for HeadlessCliRuntime {
    fn name(&self) -> &str {
        "headless"
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            streaming: true,
            token_tracking: false,
            mcp: true,
            context_reduction: true,
            available_models: Vec::new(),
            permission_modes: vec![
                PermissionMode::Default,
                PermissionMode::AcceptEdits,
                PermissionMode::BypassPermissions,
                PermissionMode::Plan,
            ],
        }
    }

    async fn execute(
        &self,
        request: AgentRequest,
        sink: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let started = Instant::now();
        let api_key = crate::resolve_api_key(&request.options);

        let replace_system = match request.options.system_prompt_mode.unwrap_or_default() {
            SystemPromptMode::Replace => Some(request.system_prompt.as_str()),
            SystemPromptMode::Append => None,
        };
        let argv = build_argv(&request.options, replace_system);
        let prompt = combine_prompt(&request);

        let mut cmd = Command::new(&self.program);
        cmd.args(&argv)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &api_key {
            cmd.env("ANTHROPIC_API_KEY", key);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", self.program, e)))?;

        // Write the prompt from a task so a large payload cannot deadlock
        // against an unread stdout pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = prompt.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_tail(&mut tail, &line);
                }
            }
            tail
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Stream("agent stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut raw_stdout = String::new();
        let mut text_output = String::new();
        let mut saw_text_delta = false;
        let mut ended = false;
        let mut seen_tool_ids: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate_then_kill(&mut child, self.grace).await;
                    return Err(RuntimeError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        raw_stdout.push_str(&line);
                        raw_stdout.push('\n');
                        if ended {
                            continue;
                        }
                        match parse_event_line(&line) {
                            Some(CliEvent::MessageUpdate {
                                assistant_message_event: AssistantMessageEvent::TextDelta { delta },
                            }) => {
                                saw_text_delta = true;
                                text_output.push_str(&delta);
                                if let Some(sink) = &sink {
                                    sink(ProgressUpdate::Text { snippet: delta });
                                }
                            }
                            Some(CliEvent::ToolExecutionStart { tool_name, id, .. }) => {
                                // one notification per unique tool invocation
                                if seen_tool_ids.insert(id.clone()) {
                                    if let Some(sink) = &sink {
                                        sink(ProgressUpdate::ToolActivity { id, tool: tool_name });
                                    }
                                }
                            }
                            Some(CliEvent::AgentEnd) => {
                                ended = true;
                            }
                            Some(CliEvent::MessageUpdate { .. })
                            | Some(CliEvent::Unknown)
                            | None => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        terminate_then_kill(&mut child, self.grace).await;
                        return Err(RuntimeError::Stream(e.to_string()));
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate_then_kill(&mut child, self.grace).await;
                return Err(RuntimeError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| RuntimeError::Io(e.to_string()))?,
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(RuntimeError::ExitFailure {
                code: status.code(),
                stderr_tail: stderr_tail.trim_end().to_string(),
            });
        }

        // No text deltas at exit: fall back to the raw stdout payload.
        let text_output = if saw_text_delta {
            text_output
        } else {
            raw_stdout.trim_end().to_string()
        };

        let extracted_data = extract_outputs(&text_output, &request.output_keys);

        Ok(AgentOutcome {
            extracted_data,
            token_usage: None,
            metadata: OutcomeMetadata {
                runtime: self.name().to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
            text_output,
        })
    }
}
