//! Per-task execution engine: the observe-plan-act-verify loop, with a
//! hard step budget, a consecutive-retry budget, and a cancellation boundary
//! at every suspension point. One worker owns one task record; nothing else
//! mutates it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::ActionDispatcher;
use crate::errors::ModelError;
use crate::model::{
    ActionKind, Observation, PlanDecision, StepOutcome, StepRecord, TaskLogLevel, TaskStatus,
    Verdict,
};
use crate::observer::observe;
use crate::planner::Planner;
use crate::registry::{TaskHandle, TaskRegistry};
use crate::verifier::Verifier;

/// Settle time after actions that do not reshape the page.
const MINOR_SETTLE_DELAY: Duration = Duration::from_millis(500);

pub struct ExecutionEngine {
    dispatcher: Arc<ActionDispatcher>,
    planner: Planner,
    verifier: Verifier,
    registry: Arc<TaskRegistry>,
    config: Arc<Config>,
}

/// Why the loop left a model call early.
enum LoopInterrupt {
    Cancelled,
    Model(ModelError),
}

impl ExecutionEngine {
    pub fn new(
        dispatcher: Arc<ActionDispatcher>,
        planner: Planner,
        verifier: Verifier,
        registry: Arc<TaskRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            dispatcher,
            planner,
            verifier,
            registry,
            config,
        }
    }

    /// Create the task record and start its worker. The worker's
    /// cancellation token is a child of `shutdown`, so process shutdown
    /// cancels every running task.
    pub fn spawn_task(self: &Arc<Self>, objective: String, shutdown: &CancellationToken) -> Uuid {
        let cancel = shutdown.child_token();
        let (task_id, handle) =
            self.registry
                .create(objective.clone(), cancel.clone(), self.config.max_steps);
        info!(task = %task_id, %objective, "task accepted");
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(handle, objective, cancel).await;
        });
        task_id
    }

    /// Run one task to a terminal state.
    pub async fn run(&self, handle: TaskHandle, objective: String, cancel: CancellationToken) {
        let task_id = handle.task_id();
        handle.log(TaskLogLevel::Info, "Task accepted", objective.clone());
        handle.set_status(TaskStatus::Planning);

        let mut history: Vec<StepRecord> = Vec::new();
        let mut consecutive_failures: u32 = 0;
        let mut total_retries: u32 = 0;
        let mut failure_context: Option<String> = None;

        let final_observation = loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&handle);
            }
            if history.len() as u32 >= self.config.max_steps {
                warn!(task = %task_id, steps = history.len(), "step budget exhausted");
                handle.log(
                    TaskLogLevel::Warning,
                    "Step budget exhausted",
                    format!("no completion within {} steps", self.config.max_steps),
                );
                handle.finish(
                    TaskStatus::Failed,
                    Some(format!(
                        "step_budget_exhausted: objective not met within {} steps",
                        self.config.max_steps
                    )),
                );
                return;
            }

            // OBSERVE
            let observation = observe(&self.dispatcher, self.config.max_elements).await;
            handle.set_observation(&observation);
            if let Some(diagnostics) = &observation.diagnostics {
                handle.log(TaskLogLevel::Warning, "Observation degraded", diagnostics.clone());
            }

            // PLAN
            let decision = match self
                .call_planner(
                    &objective,
                    &observation,
                    &history,
                    failure_context.as_deref(),
                    &cancel,
                )
                .await
            {
                Ok(decision) => decision,
                Err(LoopInterrupt::Cancelled) => return self.finish_cancelled(&handle),
                Err(LoopInterrupt::Model(err)) => {
                    if consecutive_failures < self.config.max_retries {
                        consecutive_failures += 1;
                        total_retries += 1;
                        handle.set_retry_count(total_retries);
                        failure_context = Some(format!("planner call failed: {err}"));
                        handle.set_status(TaskStatus::Replanning);
                        handle.log(TaskLogLevel::Warning, "Planner failed, replanning", err.to_string());
                        continue;
                    }
                    handle.finish(TaskStatus::Failed, Some(format!("model_error: {err}")));
                    return;
                }
            };

            let planned = match decision {
                PlanDecision::Done { reason } => {
                    handle.set_rationale(&reason);
                    handle.log(TaskLogLevel::Info, "Planner reports objective met", reason);
                    break observation;
                }
                PlanDecision::Step(planned) => planned,
            };

            // ACT
            handle.set_status(TaskStatus::Processing);
            let mut step = StepRecord::begin(history.len(), consecutive_failures + 1, &planned);
            handle.begin_step(&step);
            handle.log(
                TaskLogLevel::Step,
                format!("Step {}: {}", step.index + 1, step.action),
                step.description(),
            );

            let outcome = self.dispatcher.invoke(step.action, &step.payload).await;
            step.finished_at = Some(Utc::now());
            match outcome {
                Ok(_) => step.outcome = Some(StepOutcome::Ok),
                Err(err) => {
                    step.outcome = Some(if err.is_timeout() {
                        StepOutcome::Timeout
                    } else {
                        StepOutcome::Error
                    });
                    step.error = Some(format!("{}: {err}", err.kind()));
                    handle.log(TaskLogLevel::Error, format!("Step {} failed", step.index + 1), err.to_string());
                }
            }
            handle.complete_step(&step);

            if matches!(step.outcome, Some(StepOutcome::Ok)) {
                if !self.pause(&cancel, self.settle_delay(step.action)).await {
                    history.push(step);
                    return self.finish_cancelled(&handle);
                }
            }

            // VERIFY
            handle.set_status(TaskStatus::Verifying);
            if !self.pause(&cancel, self.config.verification_delay).await {
                history.push(step);
                return self.finish_cancelled(&handle);
            }
            let after = observe(&self.dispatcher, self.config.max_elements).await;
            let verdict = match self
                .call_step_verifier(&objective, &step, &observation, &after, &cancel)
                .await
            {
                Ok(verdict) => verdict,
                Err(LoopInterrupt::Cancelled) => {
                    history.push(step);
                    return self.finish_cancelled(&handle);
                }
                Err(LoopInterrupt::Model(err)) => {
                    history.push(step);
                    if consecutive_failures < self.config.max_retries {
                        consecutive_failures += 1;
                        total_retries += 1;
                        handle.set_retry_count(total_retries);
                        failure_context = Some(format!("verifier call failed: {err}"));
                        handle.set_status(TaskStatus::Replanning);
                        handle.log(TaskLogLevel::Warning, "Verifier failed, replanning", err.to_string());
                        continue;
                    }
                    handle.finish(TaskStatus::Failed, Some(format!("model_error: {err}")));
                    return;
                }
            };

            step.verdict = Some(verdict.verdict);
            step.verification = Some(verdict.reason.clone());
            handle.record_verdict(verdict.verdict, &verdict.reason);
            history.push(step);

            match verdict.verdict {
                Verdict::Ok => {
                    consecutive_failures = 0;
                    failure_context = None;
                    handle.set_status(TaskStatus::Planning);
                    handle.log(
                        TaskLogLevel::Success,
                        format!("Step {} verified", history.len()),
                        verdict.reason,
                    );
                }
                Verdict::Retry if consecutive_failures < self.config.max_retries => {
                    consecutive_failures += 1;
                    total_retries += 1;
                    handle.set_retry_count(total_retries);
                    let last = history.last().expect("step just pushed");
                    failure_context = Some(format!(
                        "step {} ({}) did not achieve its outcome: {}",
                        last.index + 1,
                        last.description(),
                        verdict.reason
                    ));
                    handle.set_status(TaskStatus::Replanning);
                    handle.log(TaskLogLevel::Warning, "Step needs another approach", verdict.reason);
                }
                _ => {
                    handle.finish(
                        TaskStatus::Failed,
                        Some(format!(
                            "step {} verification failed: {}",
                            history.len(),
                            verdict.reason
                        )),
                    );
                    return;
                }
            }
        };

        self.final_verify(&handle, &objective, &history, final_observation, &cancel)
            .await;
    }

    /// Final check of the objective against DOM text and an optional
    /// screenshot. Evidence gathering is best-effort; a missing excerpt or
    /// screenshot degrades the prompt instead of failing the task.
    async fn final_verify(
        &self,
        handle: &TaskHandle,
        objective: &str,
        history: &[StepRecord],
        observation: Observation,
        cancel: &CancellationToken,
    ) {
        handle.set_status(TaskStatus::Verifying);
        handle.log(
            TaskLogLevel::Info,
            "Final verification",
            "checking whether the objective was achieved",
        );

        let dom_excerpt = match self
            .dispatcher
            .query("body", Some(self.config.dom_content_limit as u64))
            .await
        {
            Ok(Value::String(text)) => truncate_chars(&text, self.config.dom_content_limit),
            Ok(other) => truncate_chars(&other.to_string(), self.config.dom_content_limit),
            Err(err) => {
                handle.log(TaskLogLevel::Warning, "Could not read final DOM", err.to_string());
                String::new()
            }
        };

        let screenshot = if self.config.capture_final_screenshot {
            match self.dispatcher.capture_screenshot().await {
                Ok(Value::String(data)) if !data.is_empty() => Some(data),
                Ok(_) => None,
                Err(err) => {
                    handle.log(TaskLogLevel::Warning, "Screenshot unavailable", err.to_string());
                    None
                }
            }
        } else {
            None
        };
        if let Some(shot) = &screenshot {
            handle.set_final_screenshot(shot.clone());
        }

        let verdict = tokio::select! {
            _ = cancel.cancelled() => return self.finish_cancelled(handle),
            result = self.verifier.check_final(
                objective,
                &observation,
                &dom_excerpt,
                history,
                screenshot.as_deref(),
            ) => result,
        };

        match verdict {
            Ok(verdict) if verdict.verdict == Verdict::Ok => {
                info!(task = %handle.task_id(), "task completed");
                handle.log(TaskLogLevel::Success, "Objective verified", verdict.reason.clone());
                handle.finish(TaskStatus::Completed, Some(verdict.reason));
            }
            Ok(verdict) => {
                warn!(task = %handle.task_id(), reason = %verdict.reason, "final verification failed");
                handle.log(TaskLogLevel::Warning, "Final verification failed", verdict.reason.clone());
                handle.finish(TaskStatus::Failed, Some(verdict.reason));
            }
            Err(err) => {
                handle.finish(TaskStatus::Failed, Some(format!("model_error: {err}")));
            }
        }
    }

    async fn call_planner(
        &self,
        objective: &str,
        observation: &Observation,
        history: &[StepRecord],
        failure: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PlanDecision, LoopInterrupt> {
        tokio::select! {
            _ = cancel.cancelled() => Err(LoopInterrupt::Cancelled),
            result = self.planner.next(objective, observation, history, failure) => {
                result.map_err(LoopInterrupt::Model)
            }
        }
    }

    async fn call_step_verifier(
        &self,
        objective: &str,
        step: &StepRecord,
        before: &Observation,
        after: &Observation,
        cancel: &CancellationToken,
    ) -> Result<crate::model::ModelVerdict, LoopInterrupt> {
        tokio::select! {
            _ = cancel.cancelled() => Err(LoopInterrupt::Cancelled),
            result = self.verifier.check_step(objective, step, before, after) => {
                result.map_err(LoopInterrupt::Model)
            }
        }
    }

    fn settle_delay(&self, action: ActionKind) -> Duration {
        match action {
            ActionKind::Navigate | ActionKind::Click | ActionKind::SmartClick => {
                self.config.page_settle_delay
            }
            // Typing needs extra time for the page to register the input.
            ActionKind::Type | ActionKind::SmartType => self.config.typing_settle_delay,
            _ => MINOR_SETTLE_DELAY.min(self.config.page_settle_delay),
        }
    }

    /// Sleep unless cancelled; returns `false` when the task was cancelled.
    async fn pause(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    fn finish_cancelled(&self, handle: &TaskHandle) {
        info!(task = %handle.task_id(), "task cancelled");
        handle.log(TaskLogLevel::Warning, "Task cancelled", "");
        handle.finish(
            TaskStatus::Cancelled,
            Some("cancelled before completion".to_string()),
        );
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}... (truncated)")
    }
}
