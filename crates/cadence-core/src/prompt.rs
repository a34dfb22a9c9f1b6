// Prompt Building
// Assembles the per-stage user prompt: preamble, visible stage history, and
// the structured-output suffix the extractor relies on.

use cadence_types::{PipelineConfig, StageConfig, StageExecution, StageStatus};

/// Longest slice of a prior stage's output included in history.
const HISTORY_OUTPUT_HEAD: usize = 600;

/// Build the user prompt for one stage invocation. `history` is the visible
/// stage list — after a context reduction it starts with the reducer record.
pub fn build_stage_prompt(
    config: &PipelineConfig,
    stage: &StageConfig,
    history: &[StageExecution],
) -> String {
    let mut sections = vec![build_preamble(config, stage)];

    if let Some(history) = build_history(history) {
        sections.push(history);
    }

    if !stage.outputs.is_empty() {
        sections.push(build_output_suffix(&stage.outputs));
    }

    sections.join("\n\n")
}

fn build_preamble(config: &PipelineConfig, stage: &StageConfig) -> String {
    format!(
        "You are running autonomously as stage `{}` of the `{}` pipeline.\n\
         No human is available for questions; use your judgment and leave the\n\
         working tree in a consistent state.",
        stage.name, config.name
    )
}

/// One block per completed prior stage: status, extracted outputs, and the
/// head of its response.
fn build_history(history: &[StageExecution]) -> Option<String> {
    let completed: Vec<&StageExecution> = history
        .iter()
        .filter(|s| s.status != StageStatus::Pending && s.status != StageStatus::Running)
        .collect();
    if completed.is_empty() {
        return None;
    }

    let mut lines = vec!["## Prior stages".to_string()];
    for stage in completed {
        lines.push(format!("### {} [{}]", stage.stage_name, status_label(stage)));
        if !stage.extracted_data.is_empty() {
            let outputs: Vec<String> = stage
                .extracted_data
                .iter()
                .map(|(key, value)| format!("- {}: {}", key, value))
                .collect();
            lines.push(outputs.join("\n"));
        }
        let head = output_head(&stage.agent_output);
        if !head.is_empty() {
            lines.push(head);
        }
    }
    Some(lines.join("\n"))
}

fn status_label(stage: &StageExecution) -> String {
    serde_json::to_value(stage.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn output_head(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= HISTORY_OUTPUT_HEAD {
        return trimmed.to_string();
    }
    let mut cut = HISTORY_OUTPUT_HEAD;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}

fn build_output_suffix(keys: &[String]) -> String {
    format!(
        "When you are done, emit a fenced ```json block containing a single\n\
         object with these keys: {}.",
        keys.join(", ")
    )
}

/// Prompt for the context reducer: everything the next stages would otherwise
/// carry, to be collapsed into one summary.
pub fn build_reduction_prompt(stages: &[StageExecution]) -> String {
    let mut lines = vec![
        "Summarize the pipeline progress below so later stages can continue\n\
         with far less context. Preserve decisions, open problems, and every\n\
         extracted output that later stages may reference."
            .to_string(),
        String::new(),
    ];
    for stage in stages {
        lines.push(format!("### {} [{}]", stage.stage_name, status_label(stage)));
        if !stage.extracted_data.is_empty() {
            for (key, value) in stage.extracted_data.iter() {
                lines.push(format!("- {}: {}", key, value));
            }
        }
        let head = output_head(&stage.agent_output);
        if !head.is_empty() {
            lines.push(head);
        }
        lines.push(String::new());
    }
    lines.push(
        "Reply with the summary text, then a fenced ```json block with any\n\
         key/value outputs that must stay addressable."
            .to_string(),
    );
    lines.join("\n")
}
