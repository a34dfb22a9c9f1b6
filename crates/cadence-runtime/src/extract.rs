// Output Extraction
// Parses structured outputs from an agent's free-form text. Pure and
// deterministic; missing keys are simply absent.

use serde_json::Value;

use cadence_types::ExtractedData;

/// Extract structured outputs from `text`.
///
/// Fenced ```json blocks are parsed first and shallow-merged (the last
/// occurrence wins per key). Keys named in `keys` that are still missing are
/// then looked for as `key: value` lines, case-insensitively; matched values
/// are trimmed, with numeric-looking values converted to numbers and
/// `true`/`false` to booleans.
pub fn extract_outputs(text: &str, keys: &[String]) -> ExtractedData {
    let mut data = ExtractedData::new();

    for block in fenced_json_blocks(text) {
        match serde_json::from_str::<Value>(&block) {
            Ok(Value::Object(object)) => {
                for (key, value) in object {
                    data.insert(key, value);
                }
            }
            Ok(_) => {} // only objects contribute keys
            Err(_) => {}
        }
    }

    for key in keys {
        if data.contains_key(key) {
            continue;
        }
        if let Some(value) = scan_key_line(text, key) {
            data.insert(key.clone(), value);
        }
    }

    data
}

/// Contents of every ```json fenced block, in document order.
fn fenced_json_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match &mut current {
            None => {
                if is_json_fence_open(trimmed) {
                    current = Some(String::new());
                }
            }
            Some(body) => {
                if trimmed.starts_with("```") {
                    blocks.push(std::mem::take(body));
                    current = None;
                } else {
                    body.push_str(line);
                    body.push('\n');
                }
            }
        }
    }

    blocks
}

fn is_json_fence_open(line: &str) -> bool {
    let Some(rest) = line.strip_prefix("```") else {
        return false;
    };
    rest.trim().eq_ignore_ascii_case("json")
}

/// Line scan for `key: value` with a case-insensitive key match.
fn scan_key_line(text: &str, key: &str) -> Option<Value> {
    for line in text.lines() {
        let Some((candidate, rest)) = line.split_once(':') else {
            continue;
        };
        if !candidate.trim().eq_ignore_ascii_case(key) {
            continue;
        }
        let raw = rest.trim();
        if raw.is_empty() {
            continue;
        }
        return Some(coerce_scalar(raw));
    }
    None
}

/// Numeric-looking values become numbers, `true`/`false` booleans, and
/// everything else stays a verbatim string.
fn coerce_scalar(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        if float.is_finite() {
            return Value::from(float);
        }
    }
    Value::String(raw.to_string())
}
