//! Page observation: `getPageInfo` and `getInteractiveElements` issued
//! concurrently and merged into one snapshot. A failed sub-call degrades the
//! observation instead of aborting the task.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::dispatch::ActionDispatcher;
use crate::model::{ElementDescriptor, Observation};

pub async fn observe(dispatcher: &ActionDispatcher, max_elements: usize) -> Observation {
    let (info, elements) = tokio::join!(dispatcher.page_info(), dispatcher.interactive_elements());

    let mut diagnostics: Vec<String> = Vec::new();
    let (url, title, ready_state) = match info {
        Ok(data) => (
            field(&data, "url"),
            field(&data, "title"),
            field(&data, "readyState"),
        ),
        Err(err) => {
            diagnostics.push(format!("getPageInfo: {err}"));
            (String::new(), String::new(), String::new())
        }
    };

    let elements = match elements {
        Ok(data) => parse_elements(data, max_elements),
        Err(err) => {
            diagnostics.push(format!("getInteractiveElements: {err}"));
            Vec::new()
        }
    };

    let observation = Observation {
        url,
        title,
        ready_state,
        elements,
        diagnostics: if diagnostics.is_empty() {
            None
        } else {
            Some(diagnostics.join("; "))
        },
        captured_at: Utc::now(),
    };
    debug!(
        url = %observation.url,
        elements = observation.elements.len(),
        degraded = observation.diagnostics.is_some(),
        "page observed"
    );
    observation
}

fn field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_elements(data: Value, max_elements: usize) -> Vec<ElementDescriptor> {
    let Value::Array(items) = data else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<ElementDescriptor>(item).ok())
        .take(max_elements)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::errors::ActionError;
    use crate::link::ActionTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct SplitAgent {
        info: Result<Value, ActionError>,
        elements: Result<Value, ActionError>,
    }

    #[async_trait]
    impl ActionTransport for SplitAgent {
        async fn call(
            &self,
            action: &str,
            _payload: Value,
            _timeout: Duration,
        ) -> Result<Value, ActionError> {
            match action {
                "getPageInfo" => self.info.clone(),
                "getInteractiveElements" => self.elements.clone(),
                other => panic!("unexpected action {other}"),
            }
        }
    }

    fn dispatcher(agent: SplitAgent) -> ActionDispatcher {
        ActionDispatcher::new(Arc::new(agent), &Config::default())
    }

    #[tokio::test]
    async fn merges_page_info_and_elements() {
        let dispatcher = dispatcher(SplitAgent {
            info: Ok(json!({"url": "https://example.com", "title": "Example", "readyState": "complete"})),
            elements: Ok(json!([
                {"type": "a", "text": "More information", "href": "https://iana.org"},
                {"type": "button", "text": "Go"},
            ])),
        });
        let observation = observe(&dispatcher, 30).await;
        assert_eq!(observation.url, "https://example.com");
        assert_eq!(observation.title, "Example");
        assert_eq!(observation.elements.len(), 2);
        assert!(observation.diagnostics.is_none());
    }

    #[tokio::test]
    async fn page_info_failure_degrades_without_aborting() {
        let dispatcher = dispatcher(SplitAgent {
            info: Err(ActionError::Timeout(Duration::from_secs(5))),
            elements: Ok(json!([{"type": "input", "name": "q"}])),
        });
        let observation = observe(&dispatcher, 30).await;
        assert!(observation.url.is_empty());
        assert_eq!(observation.elements.len(), 1);
        let diagnostics = observation.diagnostics.unwrap();
        assert!(diagnostics.contains("getPageInfo"));
    }

    #[tokio::test]
    async fn element_failure_yields_an_empty_list() {
        let dispatcher = dispatcher(SplitAgent {
            info: Ok(json!({"url": "https://example.com", "title": "Example", "readyState": "complete"})),
            elements: Err(ActionError::Action("no frame".to_string())),
        });
        let observation = observe(&dispatcher, 30).await;
        assert!(observation.elements.is_empty());
        assert!(observation.diagnostics.unwrap().contains("getInteractiveElements"));
    }

    #[tokio::test]
    async fn element_list_is_truncated_to_the_cap() {
        let many: Vec<Value> = (0..50).map(|n| json!({"type": "a", "text": n.to_string()})).collect();
        let dispatcher = dispatcher(SplitAgent {
            info: Ok(json!({"url": "https://example.com", "title": "x", "readyState": "complete"})),
            elements: Ok(Value::Array(many)),
        });
        let observation = observe(&dispatcher, 30).await;
        assert_eq!(observation.elements.len(), 30);
    }
}
