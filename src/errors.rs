use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the action link and dispatcher.
///
/// Each variant maps to one failure class of the browser control channel so
/// the engine can decide between retrying, replanning, and giving up.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// The control socket is down, closed mid-call, or delivered a frame the
    /// link could not decode.
    #[error("transport error: {0}")]
    Transport(String),

    /// The browser agent executed the action and reported failure.
    #[error("action failed: {0}")]
    Action(String),

    /// No response arrived before the per-call deadline.
    #[error("action timed out after {0:?}")]
    Timeout(Duration),

    /// Too many actions already in flight; the caller should back off.
    #[error("action link busy: too many actions in flight")]
    Busy,

    /// The action kind is not part of the agent protocol. Never sent on the
    /// wire.
    #[error("unknown action kind: {0}")]
    UnknownAction(String),

    /// The payload failed local validation before transmission.
    #[error("invalid action payload: {0}")]
    InvalidPayload(String),

    /// Navigation target is blocked by the forbidden-URL gate.
    #[error("forbidden navigation target: {0}")]
    ForbiddenUrl(String),
}

impl ActionError {
    /// Stable short tag for task history entries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::Transport(_) => "transport_error",
            ActionError::Action(_) => "action_error",
            ActionError::Timeout(_) => "timeout",
            ActionError::Busy => "busy",
            ActionError::UnknownAction(_) => "unknown_action",
            ActionError::InvalidPayload(_) => "invalid_payload",
            ActionError::ForbiddenUrl(_) => "forbidden_url",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ActionError::Timeout(_))
    }
}

/// Errors surfaced by the LLM client.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The HTTP request to the model endpoint failed outright.
    #[error("model request failed: {0}")]
    Http(String),

    /// The model endpoint answered with a non-success status.
    #[error("model endpoint returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The completion carried no usable text content.
    #[error("model response missing content")]
    MissingContent,

    /// The response stayed unparseable (or schema-invalid) after the repair
    /// retries were exhausted.
    #[error("model response did not satisfy the JSON contract: {0}")]
    Parse(String),
}

impl ModelError {
    pub fn http(err: impl std::fmt::Display) -> Self {
        ModelError::Http(err.to_string())
    }
}
