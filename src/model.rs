use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a task. `Completed`, `Failed` and `Cancelled` are terminal;
/// a record in a terminal state is never mutated again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Planning,
    Processing,
    Verifying,
    Replanning,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Planning => "planning",
            TaskStatus::Processing => "processing",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Replanning => "replanning",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Browser-side primitives understood by the agent. Variant names serialize
/// to the wire names used in action envelopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Navigate,
    WaitFor,
    Click,
    Type,
    Press,
    Query,
    GetPageInfo,
    GetInteractiveElements,
    SmartClick,
    SmartType,
    SwitchTab,
    Download,
    UploadFile,
    CaptureScreenshot,
}

impl ActionKind {
    pub const ALL: [ActionKind; 14] = [
        ActionKind::Navigate,
        ActionKind::WaitFor,
        ActionKind::Click,
        ActionKind::Type,
        ActionKind::Press,
        ActionKind::Query,
        ActionKind::GetPageInfo,
        ActionKind::GetInteractiveElements,
        ActionKind::SmartClick,
        ActionKind::SmartType,
        ActionKind::SwitchTab,
        ActionKind::Download,
        ActionKind::UploadFile,
        ActionKind::CaptureScreenshot,
    ];

    /// Name used in the `action` field of outbound envelopes.
    pub fn wire_name(self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::WaitFor => "waitFor",
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Press => "press",
            ActionKind::Query => "query",
            ActionKind::GetPageInfo => "getPageInfo",
            ActionKind::GetInteractiveElements => "getInteractiveElements",
            ActionKind::SmartClick => "smartClick",
            ActionKind::SmartType => "smartType",
            ActionKind::SwitchTab => "switchTab",
            ActionKind::Download => "download",
            ActionKind::UploadFile => "uploadFile",
            ActionKind::CaptureScreenshot => "captureScreenshot",
        }
    }

    /// Inverse of [`wire_name`](Self::wire_name); `None` for unrecognized
    /// kinds so planner output can be rejected before dispatch.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.wire_name() == name)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One interactive element surfaced by the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementDescriptor {
    #[serde(alias = "type")]
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aria_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Immutable snapshot of the page taken through the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub ready_state: String,
    pub elements: Vec<ElementDescriptor>,
    /// Populated when one of the underlying calls failed; an observation
    /// with diagnostics never aborts a task by itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Observation {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            url: String::new(),
            title: String::new(),
            ready_state: String::new(),
            elements: Vec::new(),
            diagnostics: Some(error.into()),
            captured_at: Utc::now(),
        }
    }
}

/// Outcome of a dispatched action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Ok,
    Error,
    Timeout,
}

/// Verdict issued by the verifier for one step or for the final check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ok,
    Retry,
    Fail,
}

/// Verifier output: the verdict plus the model's stated evidence.
#[derive(Debug, Clone)]
pub struct ModelVerdict {
    pub verdict: Verdict,
    pub reason: String,
}

/// A planned, dispatchable action.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub action: ActionKind,
    pub payload: Value,
    pub reason: String,
    pub expected_outcome: Option<String>,
}

/// Planner output: either the next step, or the assertion that the
/// objective is already met.
#[derive(Debug, Clone)]
pub enum PlanDecision {
    Done { reason: String },
    Step(PlannedStep),
}

/// One entry in a task's step history. Indices are contiguous from zero.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: ActionKind,
    pub payload: Value,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    /// 1-based attempt number within the current run of consecutive
    /// failures.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
}

impl StepRecord {
    pub fn begin(index: usize, attempt: u32, step: &PlannedStep) -> Self {
        Self {
            index,
            action: step.action,
            payload: step.payload.clone(),
            reason: step.reason.clone(),
            expected_outcome: step.expected_outcome.clone(),
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            error: None,
            verdict: None,
            verification: None,
        }
    }

    pub fn description(&self) -> String {
        action_description(self.action, &self.payload)
    }
}

/// Severity levels for task log entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskLogLevel {
    Info,
    Step,
    Success,
    Warning,
    Error,
}

/// Human-readable progress entry kept in the task record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: TaskLogLevel,
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Short human-readable description of an action, used in status payloads
/// and prompt history.
pub fn action_description(action: ActionKind, payload: &Value) -> String {
    let text = |key: &str| payload.get(key).and_then(Value::as_str).unwrap_or("");
    match action {
        ActionKind::Navigate => format!("Going to {}", text("url")),
        ActionKind::WaitFor => format!("Waiting for '{}'", text("selector")),
        ActionKind::Click => format!("Clicking '{}'", text("selector")),
        ActionKind::Type => format!("Typing '{}'", text("text")),
        ActionKind::Press => format!("Pressing {}", text("key")),
        ActionKind::Query => format!("Reading text under '{}'", text("selector")),
        ActionKind::GetPageInfo => "Reading page info".to_string(),
        ActionKind::GetInteractiveElements => "Listing interactive elements".to_string(),
        ActionKind::SmartClick => {
            let target = ["text", "selector", "description", "ariaLabel", "id", "name", "role"]
                .into_iter()
                .map(text)
                .find(|candidate| !candidate.is_empty())
                .unwrap_or("element");
            format!("Clicking {target}")
        }
        ActionKind::SmartType => format!("Typing '{}'", text("text")),
        ActionKind::SwitchTab => format!(
            "Switching to tab {}",
            payload.get("index").and_then(Value::as_i64).unwrap_or(0)
        ),
        ActionKind::Download => format!("Downloading {}", text("url")),
        ActionKind::UploadFile => "Uploading file".to_string(),
        ActionKind::CaptureScreenshot => "Capturing screenshot".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_kind_round_trips_through_wire_names() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::parse(kind.wire_name()), Some(kind));
        }
        assert_eq!(ActionKind::parse("teleport"), None);
    }

    #[test]
    fn action_kind_serializes_to_wire_name() {
        let encoded = serde_json::to_string(&ActionKind::GetInteractiveElements).unwrap();
        assert_eq!(encoded, "\"getInteractiveElements\"");
        let encoded = serde_json::to_string(&ActionKind::WaitFor).unwrap();
        assert_eq!(encoded, "\"waitFor\"");
    }

    #[test]
    fn element_descriptor_accepts_agent_field_names() {
        let raw = json!({
            "type": "button",
            "text": "Search",
            "ariaLabel": "Submit search",
        });
        let element: ElementDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(element.tag, "button");
        assert_eq!(element.aria_label.as_deref(), Some("Submit search"));
    }

    #[test]
    fn terminal_statuses_are_flagged() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Verifying.is_terminal());
    }

    #[test]
    fn descriptions_reference_payload_targets() {
        let described = action_description(ActionKind::SmartClick, &json!({"text": "Accept all"}));
        assert_eq!(described, "Clicking Accept all");
        let described = action_description(ActionKind::Navigate, &json!({"url": "https://example.com"}));
        assert!(described.contains("https://example.com"));
    }
}
