//! Typed façade over the action link: one operation per action kind, with
//! payload validation and the forbidden-URL gate applied before anything
//! reaches the wire.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use url::Url;

use crate::config::Config;
use crate::errors::ActionError;
use crate::link::ActionTransport;
use crate::model::ActionKind;

const DEFAULT_WAIT_FOR_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_QUERY_LIMIT: u64 = 500;

/// Locator keys accepted by `smartClick`; at least one must be present.
const SMART_CLICK_KEYS: [&str; 7] = [
    "selector",
    "id",
    "name",
    "ariaLabel",
    "role",
    "text",
    "description",
];

pub struct ActionDispatcher {
    transport: Arc<dyn ActionTransport>,
    action_timeout: Duration,
    observe_timeout: Duration,
    forbidden_url_prefixes: Vec<String>,
}

impl ActionDispatcher {
    pub fn new(transport: Arc<dyn ActionTransport>, config: &Config) -> Self {
        Self {
            transport,
            action_timeout: config.action_timeout,
            observe_timeout: config.observe_timeout,
            forbidden_url_prefixes: config.forbidden_url_prefixes.clone(),
        }
    }

    /// Dispatch a planner-provided action after validating its payload.
    pub async fn invoke(&self, action: ActionKind, payload: &Value) -> Result<Value, ActionError> {
        match action {
            ActionKind::Navigate => self.navigate(required_str(payload, "url")?).await,
            ActionKind::WaitFor => {
                self.wait_for(required_str(payload, "selector")?, optional_u64(payload, "timeout_ms"))
                    .await
            }
            ActionKind::Click => self.click(required_str(payload, "selector")?).await,
            ActionKind::Type => {
                self.type_text(
                    required_str(payload, "selector")?,
                    optional_str(payload, "text").unwrap_or(""),
                )
                .await
            }
            ActionKind::Press => self.press(required_str(payload, "key")?).await,
            ActionKind::Query => {
                self.query(required_str(payload, "selector")?, optional_u64(payload, "limit"))
                    .await
            }
            ActionKind::GetPageInfo => self.page_info().await,
            ActionKind::GetInteractiveElements => self.interactive_elements().await,
            ActionKind::SmartClick => self.smart_click(payload).await,
            ActionKind::SmartType => {
                self.smart_type(required_str(payload, "text")?, optional_str(payload, "selector"))
                    .await
            }
            ActionKind::SwitchTab => {
                let index = payload.get("index").and_then(Value::as_i64).ok_or_else(|| {
                    ActionError::InvalidPayload("switchTab requires an integer 'index'".to_string())
                })?;
                self.switch_tab(index).await
            }
            ActionKind::Download => self.download(required_str(payload, "url")?).await,
            ActionKind::UploadFile => self.upload_file(optional_str(payload, "selector")).await,
            ActionKind::CaptureScreenshot => self.capture_screenshot().await,
        }
    }

    pub async fn navigate(&self, url: &str) -> Result<Value, ActionError> {
        self.check_navigation_target(url)?;
        self.send(ActionKind::Navigate, json!({"url": url})).await
    }

    pub async fn wait_for(
        &self,
        selector: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Value, ActionError> {
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_WAIT_FOR_TIMEOUT_MS);
        self.send(
            ActionKind::WaitFor,
            json!({"selector": selector, "timeout_ms": timeout_ms}),
        )
        .await
    }

    pub async fn click(&self, selector: &str) -> Result<Value, ActionError> {
        self.send(ActionKind::Click, json!({"selector": selector})).await
    }

    pub async fn type_text(&self, selector: &str, text: &str) -> Result<Value, ActionError> {
        self.send(ActionKind::Type, json!({"selector": selector, "text": text}))
            .await
    }

    pub async fn press(&self, key: &str) -> Result<Value, ActionError> {
        self.send(ActionKind::Press, json!({"key": key})).await
    }

    pub async fn query(&self, selector: &str, limit: Option<u64>) -> Result<Value, ActionError> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        self.send(ActionKind::Query, json!({"selector": selector, "limit": limit}))
            .await
    }

    pub async fn page_info(&self) -> Result<Value, ActionError> {
        self.transport
            .call(ActionKind::GetPageInfo.wire_name(), json!({}), self.observe_timeout)
            .await
    }

    pub async fn interactive_elements(&self) -> Result<Value, ActionError> {
        self.transport
            .call(
                ActionKind::GetInteractiveElements.wire_name(),
                json!({}),
                self.observe_timeout,
            )
            .await
    }

    pub async fn smart_click(&self, locator: &Value) -> Result<Value, ActionError> {
        let payload = locator.as_object().cloned().unwrap_or_default();
        let has_locator = SMART_CLICK_KEYS.iter().any(|key| {
            payload
                .get(*key)
                .and_then(Value::as_str)
                .is_some_and(|value| !value.trim().is_empty())
        });
        if !has_locator {
            return Err(ActionError::InvalidPayload(format!(
                "smartClick requires one of {}",
                SMART_CLICK_KEYS.join(", ")
            )));
        }
        self.send(ActionKind::SmartClick, Value::Object(payload)).await
    }

    pub async fn smart_type(
        &self,
        text: &str,
        selector: Option<&str>,
    ) -> Result<Value, ActionError> {
        let mut payload = Map::new();
        payload.insert("text".to_string(), Value::String(text.to_string()));
        if let Some(selector) = selector {
            payload.insert("selector".to_string(), Value::String(selector.to_string()));
        }
        self.send(ActionKind::SmartType, Value::Object(payload)).await
    }

    pub async fn switch_tab(&self, index: i64) -> Result<Value, ActionError> {
        self.send(ActionKind::SwitchTab, json!({"index": index})).await
    }

    pub async fn download(&self, url: &str) -> Result<Value, ActionError> {
        self.check_navigation_target(url)?;
        self.send(ActionKind::Download, json!({"url": url})).await
    }

    pub async fn upload_file(&self, selector: Option<&str>) -> Result<Value, ActionError> {
        let mut payload = Map::new();
        if let Some(selector) = selector {
            payload.insert("selector".to_string(), Value::String(selector.to_string()));
        }
        self.send(ActionKind::UploadFile, Value::Object(payload)).await
    }

    pub async fn capture_screenshot(&self) -> Result<Value, ActionError> {
        self.send(ActionKind::CaptureScreenshot, json!({})).await
    }

    async fn send(&self, action: ActionKind, payload: Value) -> Result<Value, ActionError> {
        self.transport
            .call(action.wire_name(), payload, self.action_timeout)
            .await
    }

    /// Authoritative gate for navigation targets: must parse as an absolute
    /// URL and must not match a forbidden prefix.
    fn check_navigation_target(&self, url: &str) -> Result<(), ActionError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(ActionError::InvalidPayload("url must not be empty".to_string()));
        }
        let lowered = trimmed.to_ascii_lowercase();
        for prefix in &self.forbidden_url_prefixes {
            if lowered.starts_with(&prefix.to_ascii_lowercase()) {
                return Err(ActionError::ForbiddenUrl(trimmed.to_string()));
            }
        }
        Url::parse(trimmed).map_err(|err| {
            ActionError::InvalidPayload(format!("'{trimmed}' is not an absolute URL: {err}"))
        })?;
        Ok(())
    }
}

fn required_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    match payload.get(key).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ActionError::InvalidPayload(format!(
            "missing required field '{key}'"
        ))),
    }
}

fn optional_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn optional_u64(payload: &Value, key: &str) -> Option<u64> {
    payload.get(key).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every call and answers with a canned success payload.
    struct RecordingAgent {
        calls: Mutex<Vec<(String, Value, Duration)>>,
    }

    impl RecordingAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn last_call(&self) -> (String, Value, Duration) {
            self.calls.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ActionTransport for RecordingAgent {
        async fn call(
            &self,
            action: &str,
            payload: Value,
            timeout: Duration,
        ) -> Result<Value, ActionError> {
            self.calls
                .lock()
                .push((action.to_string(), payload, timeout));
            Ok(json!({"ok": true}))
        }
    }

    fn dispatcher(agent: Arc<RecordingAgent>) -> ActionDispatcher {
        ActionDispatcher::new(agent, &Config::default())
    }

    #[tokio::test]
    async fn navigate_rejects_forbidden_prefixes() {
        let agent = RecordingAgent::new();
        let dispatcher = dispatcher(agent.clone());
        for target in [
            "chrome://settings",
            "edge://flags",
            "about:blank",
            "chrome-extension://abcdef/page.html",
            "CHROME://history",
        ] {
            let result = dispatcher.navigate(target).await;
            assert!(
                matches!(result, Err(ActionError::ForbiddenUrl(_))),
                "{target} should be forbidden"
            );
        }
        assert!(agent.calls.lock().is_empty(), "nothing may reach the agent");
    }

    #[tokio::test]
    async fn navigate_rejects_relative_urls() {
        let dispatcher = dispatcher(RecordingAgent::new());
        let result = dispatcher.navigate("example.com/path").await;
        assert!(matches!(result, Err(ActionError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn wait_for_applies_the_default_timeout() {
        let agent = RecordingAgent::new();
        let dispatcher = dispatcher(agent.clone());
        dispatcher.wait_for("#result", None).await.unwrap();
        let (action, payload, _) = agent.last_call();
        assert_eq!(action, "waitFor");
        assert_eq!(payload["timeout_ms"], 5_000);
    }

    #[tokio::test]
    async fn query_applies_the_default_limit() {
        let agent = RecordingAgent::new();
        let dispatcher = dispatcher(agent.clone());
        dispatcher.query("body", None).await.unwrap();
        let (_, payload, _) = agent.last_call();
        assert_eq!(payload["limit"], 500);
    }

    #[tokio::test]
    async fn smart_click_requires_a_locator() {
        let dispatcher = dispatcher(RecordingAgent::new());
        let result = dispatcher.smart_click(&json!({})).await;
        assert!(matches!(result, Err(ActionError::InvalidPayload(_))));
        let result = dispatcher.smart_click(&json!({"text": "  "})).await;
        assert!(matches!(result, Err(ActionError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn smart_click_accepts_any_single_locator_key() {
        let agent = RecordingAgent::new();
        let dispatcher = dispatcher(agent.clone());
        dispatcher
            .smart_click(&json!({"ariaLabel": "Submit search"}))
            .await
            .unwrap();
        let (action, payload, _) = agent.last_call();
        assert_eq!(action, "smartClick");
        assert_eq!(payload["ariaLabel"], "Submit search");
    }

    #[tokio::test]
    async fn invoke_validates_planner_payloads() {
        let dispatcher = dispatcher(RecordingAgent::new());
        let result = dispatcher.invoke(ActionKind::Navigate, &json!({})).await;
        assert!(matches!(result, Err(ActionError::InvalidPayload(_))));
        let result = dispatcher
            .invoke(ActionKind::SwitchTab, &json!({"index": "two"}))
            .await;
        assert!(matches!(result, Err(ActionError::InvalidPayload(_))));
        let result = dispatcher
            .invoke(ActionKind::SmartType, &json!({"selector": "#q"}))
            .await;
        assert!(matches!(result, Err(ActionError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn observation_calls_use_the_short_deadline() {
        let agent = RecordingAgent::new();
        let dispatcher = dispatcher(agent.clone());
        dispatcher.page_info().await.unwrap();
        let (_, _, timeout) = agent.last_call();
        assert_eq!(timeout, Config::default().observe_timeout);
    }
}
