//! Strict parsing of model output. The model is an untrusted source: the
//! action kind is checked against the known set and payload fields are
//! validated before anything is dispatched. Parse errors return the reason
//! as a `String` so the client can feed it back in a repair attempt.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::model::{ActionKind, ModelVerdict, PlanDecision, PlannedStep, Verdict};

/// Pull the first JSON object out of a completion that may be wrapped in
/// code fences or surrounding prose.
pub fn extract_json_object(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }

    let body = match trimmed.find("```") {
        Some(start) => {
            let inner = &trimmed[start + 3..];
            let inner = inner.trim_start_matches(|c: char| c.is_alphanumeric() || c == '_');
            match inner.find("```") {
                Some(end) => &inner[..end],
                None => inner,
            }
        }
        None => trimmed,
    };

    let open = body.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in body[open..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(body[open..open + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default, alias = "reasoning")]
    reason: Option<String>,
    #[serde(default, alias = "task_complete")]
    done: Option<Value>,
    #[serde(default)]
    expected_outcome: Option<String>,
}

/// Parse and validate a planner completion.
pub fn parse_plan(raw: &str) -> Result<PlanDecision, String> {
    let text = extract_json_object(raw).ok_or("response contains no JSON object")?;
    let plan: RawPlan =
        serde_json::from_str(&text).map_err(|err| format!("response is not a JSON object: {err}"))?;

    if truthy(plan.done.as_ref()) {
        return Ok(PlanDecision::Done {
            reason: plan
                .reason
                .filter(|reason| !reason.trim().is_empty())
                .unwrap_or_else(|| "objective reported complete".to_string()),
        });
    }

    let action_name = plan
        .action
        .filter(|name| !name.trim().is_empty())
        .ok_or("plan is missing the 'action' field")?;
    let action = ActionKind::parse(action_name.trim())
        .ok_or_else(|| format!("unknown action kind '{}'", action_name.trim()))?;

    let mut payload = match plan.payload {
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::Null) | None => json!({}),
        Some(other) => return Err(format!("payload must be a JSON object, got {other}")),
    };
    validate_payload(action, &mut payload)?;

    Ok(PlanDecision::Step(PlannedStep {
        action,
        payload,
        reason: plan.reason.unwrap_or_default(),
        expected_outcome: plan.expected_outcome.filter(|s| !s.trim().is_empty()),
    }))
}

fn validate_payload(action: ActionKind, payload: &mut Value) -> Result<(), String> {
    let has_str = |payload: &Value, key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|value| !value.trim().is_empty())
    };

    match action {
        ActionKind::Navigate | ActionKind::Download => {
            if !has_str(payload, "url") {
                return Err(format!("{action} requires 'url' in the payload"));
            }
        }
        ActionKind::Type | ActionKind::SmartType => {
            if !has_str(payload, "text") {
                return Err(format!("{action} requires 'text' in the payload"));
            }
        }
        ActionKind::Press => {
            if !has_str(payload, "key") {
                // The agent treats Enter as the default submit key.
                payload["key"] = json!("Enter");
            }
        }
        ActionKind::Click | ActionKind::WaitFor | ActionKind::Query => {
            if !has_str(payload, "selector") {
                return Err(format!("{action} requires 'selector' in the payload"));
            }
        }
        ActionKind::SmartClick => {
            let keys = ["selector", "id", "name", "ariaLabel", "role", "text", "description"];
            if !keys.iter().any(|key| has_str(payload, key)) {
                return Err(format!("{action} requires one of {}", keys.join(", ")));
            }
        }
        ActionKind::SwitchTab => {
            if payload.get("index").and_then(Value::as_i64).is_none() {
                return Err(format!("{action} requires an integer 'index'"));
            }
        }
        ActionKind::UploadFile
        | ActionKind::GetPageInfo
        | ActionKind::GetInteractiveElements
        | ActionKind::CaptureScreenshot => {}
    }
    Ok(())
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default, alias = "message")]
    reason: Option<String>,
}

/// Parse a verifier completion into a verdict.
pub fn parse_verdict(raw: &str) -> Result<ModelVerdict, String> {
    let text = extract_json_object(raw).ok_or("response contains no JSON object")?;
    let parsed: RawVerdict =
        serde_json::from_str(&text).map_err(|err| format!("response is not a JSON object: {err}"))?;
    let label = parsed
        .verdict
        .ok_or("verdict response is missing the 'verdict' field")?;
    let verdict = match label.trim().to_ascii_lowercase().as_str() {
        "ok" | "success" => Verdict::Ok,
        "retry" => Verdict::Retry,
        "fail" | "failed" => Verdict::Fail,
        other => return Err(format!("unknown verdict '{other}'")),
    };
    Ok(ModelVerdict {
        verdict,
        reason: parsed.reason.unwrap_or_default(),
    })
}
