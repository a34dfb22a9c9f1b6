// Condition Evaluation
// Gating expressions over prior stage outputs, e.g.
// `{{ stages.lint.outputs.issues == 0 && stages.lint.status == "success" }}`.
// The evaluator never errors into the scheduler path: anything unresolvable
// evaluates to false with a warning.

use serde_json::Value;

use cadence_types::StageExecution;

/// Evaluate a gating expression against completed stages. Conjunctions only;
/// every clause must hold.
pub fn evaluate_condition(expr: &str, stages: &[StageExecution]) -> bool {
    let inner = strip_braces(expr);
    if inner.is_empty() {
        tracing::warn!("empty condition treated as false: '{}'", expr);
        return false;
    }

    inner.split("&&").all(|clause| {
        let clause = clause.trim();
        match evaluate_clause(clause, stages) {
            Ok(result) => result,
            Err(reason) => {
                tracing::warn!("condition clause '{}' is false: {}", clause, reason);
                false
            }
        }
    })
}

fn strip_braces(expr: &str) -> &str {
    let trimmed = expr.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

/// Static syntax probe for validation: checks shape without resolving stage
/// references.
pub fn validate_condition_syntax(expr: &str) -> Result<(), String> {
    let inner = strip_braces(expr);
    if inner.is_empty() {
        return Err("condition is empty".to_string());
    }
    for clause in inner.split("&&") {
        let clause = clause.trim();
        let (lhs, _, rhs) = split_operator(clause)?;
        let segments: Vec<&str> = lhs.trim().split('.').collect();
        let shape_ok = segments.first() == Some(&"stages")
            && (matches!(segments.as_slice(), ["stages", name, "status"] if !name.is_empty())
                || matches!(
                    segments.as_slice(),
                    ["stages", name, "outputs", key] if !name.is_empty() && !key.is_empty()
                ));
        if !shape_ok {
            return Err(format!(
                "left side must be stages.<name>.outputs.<key> or stages.<name>.status, got '{}'",
                lhs.trim()
            ));
        }
        if rhs.trim().is_empty() {
            return Err(format!("clause '{}' has no right-hand value", clause));
        }
    }
    Ok(())
}

fn evaluate_clause(clause: &str, stages: &[StageExecution]) -> Result<bool, String> {
    let (lhs_raw, op, rhs_raw) = split_operator(clause)?;
    let lhs = resolve_path(lhs_raw.trim(), stages)?;
    let rhs = parse_literal(rhs_raw.trim());
    compare(&lhs, op, &rhs)
}

fn split_operator(clause: &str) -> Result<(&str, &str, &str), String> {
    for op in OPERATORS {
        if let Some(at) = clause.find(op) {
            let (lhs, rest) = clause.split_at(at);
            return Ok((lhs, op, &rest[op.len()..]));
        }
    }
    Err("no comparison operator".to_string())
}

/// Resolve `stages.<name>.outputs.<key>` or `stages.<name>.status`.
fn resolve_path(path: &str, stages: &[StageExecution]) -> Result<Value, String> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.first() != Some(&"stages") {
        return Err(format!("unsupported reference '{}'", path));
    }
    let name = segments
        .get(1)
        .ok_or_else(|| "missing stage name".to_string())?;
    let stage = stages
        .iter()
        .find(|s| s.stage_name == *name)
        .ok_or_else(|| format!("unknown stage '{}'", name))?;

    match segments.get(2) {
        Some(&"status") if segments.len() == 3 => Ok(Value::String(status_name(stage))),
        Some(&"outputs") => {
            let key = segments
                .get(3)
                .ok_or_else(|| "missing output key".to_string())?;
            if segments.len() != 4 {
                return Err(format!("unsupported reference '{}'", path));
            }
            stage
                .extracted_data
                .get(key)
                .cloned()
                .ok_or_else(|| format!("stage '{}' has no output '{}'", name, key))
        }
        _ => Err(format!("unsupported reference '{}'", path)),
    }
}

fn status_name(stage: &StageExecution) -> String {
    serde_json::to_value(stage.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_literal(raw: &str) -> Value {
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    if let Some(text) = unquoted {
        return Value::String(text.to_string());
    }
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

fn compare(lhs: &Value, op: &str, rhs: &Value) -> Result<bool, String> {
    // numeric comparison when both sides are numbers
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return Ok(match op {
            "==" => a == b,
            "!=" => a != b,
            ">" => a > b,
            ">=" => a >= b,
            "<" => a < b,
            "<=" => a <= b,
            _ => return Err(format!("unsupported operator '{}'", op)),
        });
    }

    match op {
        "==" => Ok(values_equal(lhs, rhs)),
        "!=" => Ok(!values_equal(lhs, rhs)),
        _ => Err(format!(
            "operator '{}' needs numeric operands (got {} and {})",
            op, lhs, rhs
        )),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        // loose equality across string/bool so `outputs.ok == "true"` works
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b.eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
        _ => lhs == rhs,
    }
}
