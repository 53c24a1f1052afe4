//! End-to-end engine scenarios against a scripted browser agent and a
//! scripted model provider.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use webpilot::config::Config;
use webpilot::dispatch::ActionDispatcher;
use webpilot::engine::ExecutionEngine;
use webpilot::errors::{ActionError, ModelError};
use webpilot::link::ActionTransport;
use webpilot::llm::prompt::{FinalVerifyContext, PlanContext, StepVerifyContext};
use webpilot::llm::LlmProvider;
use webpilot::model::{
    ActionKind, ModelVerdict, PlanDecision, PlannedStep, TaskStatus, Verdict,
};
use webpilot::planner::Planner;
use webpilot::registry::{TaskRegistry, TaskSnapshot};
use webpilot::verifier::Verifier;

/// Pops scripted items; once the queue drains, keeps yielding the fallback.
struct Script<T: Clone> {
    queue: Mutex<VecDeque<T>>,
    fallback: Option<T>,
}

impl<T: Clone> Script<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            queue: Mutex::new(items.into()),
            fallback: None,
        }
    }

    fn repeating(fallback: T) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Some(fallback),
        }
    }

    fn next(&self) -> Option<T> {
        self.queue
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone())
    }
}

struct ScriptedProvider {
    plans: Script<Result<PlanDecision, String>>,
    step_verdicts: Script<Result<ModelVerdict, String>>,
    final_verdicts: Script<Result<ModelVerdict, String>>,
}

fn model_err(message: String) -> ModelError {
    ModelError::Parse(message)
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn plan_next(&self, _ctx: &PlanContext<'_>) -> Result<PlanDecision, ModelError> {
        match self.plans.next() {
            Some(Ok(plan)) => Ok(plan),
            Some(Err(message)) => Err(model_err(message)),
            None => panic!("planner called more often than scripted"),
        }
    }

    async fn verify_step(&self, _ctx: &StepVerifyContext<'_>) -> Result<ModelVerdict, ModelError> {
        match self.step_verdicts.next() {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(message)) => Err(model_err(message)),
            None => panic!("step verifier called more often than scripted"),
        }
    }

    async fn verify_final(&self, _ctx: &FinalVerifyContext<'_>) -> Result<ModelVerdict, ModelError> {
        match self.final_verdicts.next() {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(message)) => Err(model_err(message)),
            None => panic!("final verifier called more often than scripted"),
        }
    }
}

/// Provider whose planner call never returns; used for cancellation tests.
struct HangingProvider;

#[async_trait]
impl LlmProvider for HangingProvider {
    async fn plan_next(&self, _ctx: &PlanContext<'_>) -> Result<PlanDecision, ModelError> {
        std::future::pending::<Result<PlanDecision, ModelError>>().await
    }

    async fn verify_step(&self, _ctx: &StepVerifyContext<'_>) -> Result<ModelVerdict, ModelError> {
        std::future::pending::<Result<ModelVerdict, ModelError>>().await
    }

    async fn verify_final(&self, _ctx: &FinalVerifyContext<'_>) -> Result<ModelVerdict, ModelError> {
        std::future::pending::<Result<ModelVerdict, ModelError>>().await
    }
}

/// Browser agent double: scripted responses per action kind, canned
/// defaults otherwise.
struct MockAgent {
    scripted: Mutex<HashMap<&'static str, VecDeque<Result<Value, ActionError>>>>,
    calls: Mutex<Vec<String>>,
}

impl MockAgent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn script(self: &Arc<Self>, action: &'static str, responses: Vec<Result<Value, ActionError>>) {
        self.scripted.lock().insert(action, responses.into());
    }

    fn calls_of(&self, action: &str) -> usize {
        self.calls.lock().iter().filter(|a| *a == action).count()
    }
}

#[async_trait]
impl ActionTransport for MockAgent {
    async fn call(
        &self,
        action: &str,
        _payload: Value,
        _timeout: Duration,
    ) -> Result<Value, ActionError> {
        self.calls.lock().push(action.to_string());
        if let Some(queue) = self.scripted.lock().get_mut(action) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        Ok(default_response(action))
    }
}

fn default_response(action: &str) -> Value {
    match action {
        "getPageInfo" => json!({
            "url": "https://example.com",
            "title": "Example Domain",
            "readyState": "complete",
        }),
        "getInteractiveElements" => json!([
            {"type": "a", "text": "More information", "href": "https://www.iana.org"},
        ]),
        "query" => json!("Example Domain. This domain is for use in illustrative examples."),
        "captureScreenshot" => json!("iVBORw0KGgo="),
        _ => json!({"ok": true}),
    }
}

fn navigate_step(url: &str) -> PlanDecision {
    PlanDecision::Step(PlannedStep {
        action: ActionKind::Navigate,
        payload: json!({"url": url}),
        reason: "open the target page".to_string(),
        expected_outcome: Some("the target page is shown".to_string()),
    })
}

fn click_step(text: &str) -> PlanDecision {
    PlanDecision::Step(PlannedStep {
        action: ActionKind::SmartClick,
        payload: json!({"text": text}),
        reason: format!("click '{text}'"),
        expected_outcome: None,
    })
}

fn done(reason: &str) -> PlanDecision {
    PlanDecision::Done {
        reason: reason.to_string(),
    }
}

fn verdict(verdict: Verdict, reason: &str) -> Result<ModelVerdict, String> {
    Ok(ModelVerdict {
        verdict,
        reason: reason.to_string(),
    })
}

fn fast_config() -> Config {
    Config {
        page_settle_delay: Duration::ZERO,
        typing_settle_delay: Duration::ZERO,
        verification_delay: Duration::ZERO,
        ..Config::default()
    }
}

fn build_engine(
    provider: Arc<dyn LlmProvider>,
    agent: Arc<dyn ActionTransport>,
    config: Config,
) -> (Arc<ExecutionEngine>, Arc<TaskRegistry>) {
    let config = Arc::new(config);
    let registry = Arc::new(TaskRegistry::new());
    let dispatcher = Arc::new(ActionDispatcher::new(agent, &config));
    let engine = Arc::new(ExecutionEngine::new(
        dispatcher,
        Planner::new(provider.clone()),
        Verifier::new(provider),
        registry.clone(),
        config,
    ));
    (engine, registry)
}

async fn wait_terminal(registry: &TaskRegistry, task_id: &Uuid) -> TaskSnapshot {
    for _ in 0..1000 {
        if let Some(snapshot) = registry.snapshot(task_id) {
            if snapshot.status.is_terminal() {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task did not reach a terminal state in time");
}

#[tokio::test]
async fn single_navigation_completes_cleanly() {
    let provider = Arc::new(ScriptedProvider {
        plans: Script::new(vec![
            Ok(navigate_step("https://example.com")),
            Ok(done("the example page is open")),
        ]),
        step_verdicts: Script::new(vec![verdict(Verdict::Ok, "url and title match")]),
        final_verdicts: Script::new(vec![verdict(Verdict::Ok, "objective satisfied")]),
    });
    let agent = MockAgent::new();
    let (engine, registry) = build_engine(provider, agent.clone(), fast_config());

    let task_id = engine.spawn_task(
        "Go to https://example.com".to_string(),
        &CancellationToken::new(),
    );
    let snapshot = wait_terminal(&registry, &task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.steps_executed, 1);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.verification.as_deref(), Some("objective satisfied"));
    assert_eq!(agent.calls_of("navigate"), 1);
    // Final evidence gathering pulled DOM text and a screenshot.
    assert_eq!(agent.calls_of("query"), 1);
    assert_eq!(agent.calls_of("captureScreenshot"), 1);
}

#[tokio::test]
async fn failed_click_is_replanned_then_succeeds() {
    let provider = Arc::new(ScriptedProvider {
        plans: Script::new(vec![
            Ok(click_step("Missing button")),
            Ok(click_step("More information")),
            Ok(done("details page is open")),
        ]),
        step_verdicts: Script::new(vec![
            verdict(Verdict::Retry, "nothing changed on the page"),
            verdict(Verdict::Ok, "details content visible"),
        ]),
        final_verdicts: Script::new(vec![verdict(Verdict::Ok, "objective satisfied")]),
    });
    let agent = MockAgent::new();
    agent.script(
        "smartClick",
        vec![
            Err(ActionError::Action("element_not_found".to_string())),
            Ok(json!({"clicked": true, "method": "text"})),
        ],
    );
    let (engine, registry) = build_engine(provider, agent.clone(), fast_config());

    let task_id = engine.spawn_task(
        "Open the details page".to_string(),
        &CancellationToken::new(),
    );
    let snapshot = wait_terminal(&registry, &task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.steps_executed, 2);
    assert_eq!(snapshot.retry_count, 1);
    assert_eq!(agent.calls_of("smartClick"), 2);
}

#[tokio::test]
async fn step_budget_exhaustion_fails_the_task() {
    let provider = Arc::new(ScriptedProvider {
        plans: Script::repeating(Ok(navigate_step("https://example.com"))),
        step_verdicts: Script::repeating(verdict(Verdict::Ok, "page reloaded")),
        final_verdicts: Script::new(vec![]),
    });
    let agent = MockAgent::new();
    let (engine, registry) = build_engine(provider, agent.clone(), fast_config());

    let task_id = engine.spawn_task(
        "Loop forever".to_string(),
        &CancellationToken::new(),
    );
    let snapshot = wait_terminal(&registry, &task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.steps_executed, 20);
    assert!(snapshot
        .verification
        .as_deref()
        .unwrap()
        .contains("step_budget_exhausted"));
    assert_eq!(agent.calls_of("navigate"), 20);
}

#[tokio::test]
async fn consecutive_retries_exhaust_before_the_step_budget() {
    let provider = Arc::new(ScriptedProvider {
        plans: Script::repeating(Ok(click_step("Anything"))),
        step_verdicts: Script::repeating(verdict(Verdict::Retry, "still nothing happened")),
        final_verdicts: Script::new(vec![]),
    });
    let agent = MockAgent::new();
    let (engine, registry) = build_engine(provider, agent, fast_config());

    let task_id = engine.spawn_task(
        "Click something that never works".to_string(),
        &CancellationToken::new(),
    );
    let snapshot = wait_terminal(&registry, &task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Failed);
    // max_retries consecutive retries, then the next retry verdict fails.
    assert_eq!(snapshot.retry_count, 3);
    assert_eq!(snapshot.steps_executed, 4);
    assert!(snapshot
        .verification
        .as_deref()
        .unwrap()
        .contains("verification failed"));
}

#[tokio::test]
async fn persistent_model_failure_terminates_the_task() {
    let provider = Arc::new(ScriptedProvider {
        plans: Script::repeating(Err("model kept returning prose".to_string())),
        step_verdicts: Script::new(vec![]),
        final_verdicts: Script::new(vec![]),
    });
    let agent = MockAgent::new();
    let (engine, registry) = build_engine(provider, agent, fast_config());

    let task_id = engine.spawn_task(
        "Anything".to_string(),
        &CancellationToken::new(),
    );
    let snapshot = wait_terminal(&registry, &task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.retry_count, 3);
    assert_eq!(snapshot.steps_executed, 0);
    assert!(snapshot
        .verification
        .as_deref()
        .unwrap()
        .contains("model_error"));
}

#[tokio::test]
async fn shutdown_cancels_the_task_and_freezes_the_record() {
    let agent = MockAgent::new();
    let (engine, registry) = build_engine(Arc::new(HangingProvider), agent, fast_config());

    let shutdown = CancellationToken::new();
    let task_id = engine.spawn_task("Never finishes".to_string(), &shutdown);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!registry
        .snapshot(&task_id)
        .unwrap()
        .status
        .is_terminal());

    shutdown.cancel();
    let snapshot = wait_terminal(&registry, &task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert_eq!(snapshot.steps_executed, 0);

    // The record is frozen after cancellation.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let later = registry.snapshot(&task_id).unwrap();
    assert_eq!(later.status, TaskStatus::Cancelled);
    assert_eq!(later.finished_at, snapshot.finished_at);
}

#[tokio::test]
async fn dispatch_timeout_is_recorded_distinctly_and_replanned() {
    let provider = Arc::new(ScriptedProvider {
        plans: Script::new(vec![
            Ok(navigate_step("https://example.com")),
            Ok(navigate_step("https://example.com")),
            Ok(done("page is open")),
        ]),
        step_verdicts: Script::new(vec![
            verdict(Verdict::Retry, "no response from the browser"),
            verdict(Verdict::Ok, "page loaded"),
        ]),
        final_verdicts: Script::new(vec![verdict(Verdict::Ok, "objective satisfied")]),
    });
    let agent = MockAgent::new();
    agent.script(
        "navigate",
        vec![
            Err(ActionError::Timeout(Duration::from_secs(20))),
            Ok(json!({"navigated": true})),
        ],
    );
    let (engine, registry) = build_engine(provider, agent, fast_config());

    let task_id = engine.spawn_task(
        "Go to https://example.com".to_string(),
        &CancellationToken::new(),
    );
    let snapshot = wait_terminal(&registry, &task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.retry_count, 1);
    assert_eq!(snapshot.steps_executed, 2);
}
