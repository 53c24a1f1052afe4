//! In-memory task registry. The map is read-mostly; each record sits behind
//! its own short-lived lock. Engine workers mutate records through a
//! [`TaskHandle`]; everyone else reads atomic snapshots. Records in a
//! terminal state are never mutated again.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::model::{
    ActionKind, Observation, StepRecord, TaskLogEntry, TaskLogLevel, TaskStatus, Verdict,
};

const LOG_CAPACITY: usize = 200;

/// Step descriptor surfaced while a step is in flight.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentStep {
    pub index: usize,
    pub action: ActionKind,
    pub description: String,
}

/// Read-only view of a task served by the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub objective: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub steps_executed: usize,
    /// Configured step budget for the run.
    pub total_steps: u32,
    /// Cumulative retries spent across the run.
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<CurrentStep>,
    /// Rationale of the most recent planner decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observation: Option<Observation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    /// Base64 PNG captured during final verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_screenshot: Option<String>,
    pub logs: Vec<TaskLogEntry>,
}

struct TaskRecord {
    objective: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: TaskStatus,
    steps: Vec<StepRecord>,
    retry_count: u32,
    current_step: Option<CurrentStep>,
    last_observation: Option<Observation>,
    last_rationale: Option<String>,
    verification: Option<String>,
    final_screenshot: Option<String>,
    logs: VecDeque<TaskLogEntry>,
    cancel: CancellationToken,
    step_budget: u32,
}

impl TaskRecord {
    fn new(objective: String, cancel: CancellationToken, step_budget: u32) -> Self {
        Self {
            objective,
            created_at: Utc::now(),
            finished_at: None,
            status: TaskStatus::Queued,
            steps: Vec::new(),
            retry_count: 0,
            current_step: None,
            last_observation: None,
            last_rationale: None,
            verification: None,
            final_screenshot: None,
            logs: VecDeque::new(),
            cancel,
            step_budget,
        }
    }

    fn snapshot(&self, task_id: Uuid) -> TaskSnapshot {
        TaskSnapshot {
            task_id,
            objective: self.objective.clone(),
            status: self.status,
            created_at: self.created_at,
            finished_at: self.finished_at,
            steps_executed: self.steps.len(),
            total_steps: self.step_budget,
            retry_count: self.retry_count,
            current_step: self.current_step.clone(),
            last_rationale: self.last_rationale.clone(),
            last_observation: self.last_observation.clone(),
            verification: self.verification.clone(),
            final_screenshot: self.final_screenshot.clone(),
            logs: self.logs.iter().cloned().collect(),
        }
    }

    fn push_log(&mut self, level: TaskLogLevel, title: impl Into<String>, detail: impl Into<String>) {
        if self.logs.len() == LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(TaskLogEntry {
            timestamp: Utc::now(),
            level,
            title: title.into(),
            detail: detail.into(),
        });
    }
}

pub struct TaskRegistry {
    records: DashMap<Uuid, Mutex<TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Create a record in `queued` state and return its mutation handle.
    pub fn create(
        self: &Arc<Self>,
        objective: String,
        cancel: CancellationToken,
        step_budget: u32,
    ) -> (Uuid, TaskHandle) {
        let task_id = Uuid::new_v4();
        let record = TaskRecord::new(objective, cancel, step_budget);
        self.records.insert(task_id, Mutex::new(record));
        (
            task_id,
            TaskHandle {
                registry: Arc::clone(self),
                task_id,
            },
        )
    }

    pub fn exists(&self, task_id: &Uuid) -> bool {
        self.records.contains_key(task_id)
    }

    pub fn snapshot(&self, task_id: &Uuid) -> Option<TaskSnapshot> {
        let entry = self.records.get(task_id)?;
        let record = entry.value().lock();
        Some(record.snapshot(*task_id))
    }

    /// Cancel (when still running) and remove a record.
    pub fn remove(&self, task_id: &Uuid) -> bool {
        match self.records.remove(task_id) {
            Some((_, record)) => {
                record.lock().cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop terminal records beyond the `keep_last_n` most recent ones.
    pub fn cleanup_terminal(&self, keep_last_n: usize) -> usize {
        let mut terminal: Vec<(Uuid, DateTime<Utc>)> = self
            .records
            .iter()
            .filter_map(|entry| {
                let record = entry.value().lock();
                record
                    .status
                    .is_terminal()
                    .then(|| (*entry.key(), record.created_at))
            })
            .collect();
        if terminal.len() <= keep_last_n {
            return 0;
        }
        terminal.sort_by_key(|(_, created_at)| *created_at);
        let excess = terminal.len() - keep_last_n;
        let mut removed = 0;
        for (task_id, _) in terminal.into_iter().take(excess) {
            if self.records.remove(&task_id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn total_count(&self) -> usize {
        self.records.len()
    }

    pub fn active_count(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| !entry.value().lock().status.is_terminal())
            .count()
    }

    /// Raise the cancellation signal on every non-terminal task.
    pub fn cancel_all(&self) {
        for entry in self.records.iter() {
            let record = entry.value().lock();
            if !record.status.is_terminal() {
                record.cancel.cancel();
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutation handle owned by the engine worker of one task. Every mutation
/// is ignored once the record reached a terminal state.
#[derive(Clone)]
pub struct TaskHandle {
    registry: Arc<TaskRegistry>,
    task_id: Uuid,
}

impl TaskHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    fn mutate(&self, apply: impl FnOnce(&mut TaskRecord)) {
        let Some(entry) = self.registry.records.get(&self.task_id) else {
            return;
        };
        let mut record = entry.value().lock();
        if record.status.is_terminal() {
            warn!(task = %self.task_id, "ignoring mutation of terminal task");
            return;
        }
        apply(&mut record);
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.mutate(|record| record.status = status);
    }

    pub fn set_retry_count(&self, retry_count: u32) {
        self.mutate(|record| record.retry_count = retry_count);
    }

    pub fn set_observation(&self, observation: &Observation) {
        self.mutate(|record| record.last_observation = Some(observation.clone()));
    }

    /// Record the step being dispatched and surface it as the current step.
    pub fn begin_step(&self, step: &StepRecord) {
        self.mutate(|record| {
            record.current_step = Some(CurrentStep {
                index: step.index,
                action: step.action,
                description: step.description(),
            });
            record.last_rationale = Some(step.reason.clone());
            record.steps.push(step.clone());
        });
    }

    pub fn set_rationale(&self, rationale: &str) {
        self.mutate(|record| record.last_rationale = Some(rationale.to_string()));
    }

    pub fn set_final_screenshot(&self, screenshot: String) {
        self.mutate(|record| record.final_screenshot = Some(screenshot));
    }

    /// Replace the latest step entry with its completed form.
    pub fn complete_step(&self, step: &StepRecord) {
        self.mutate(|record| {
            if let Some(last) = record.steps.last_mut() {
                *last = step.clone();
            }
        });
    }

    pub fn record_verdict(&self, verdict: Verdict, reason: &str) {
        self.mutate(|record| {
            if let Some(last) = record.steps.last_mut() {
                last.verdict = Some(verdict);
                last.verification = Some(reason.to_string());
            }
        });
    }

    pub fn log(&self, level: TaskLogLevel, title: impl Into<String>, detail: impl Into<String>) {
        self.mutate(|record| record.push_log(level, title, detail));
    }

    /// Transition into a terminal state; the record becomes immutable.
    pub fn finish(&self, status: TaskStatus, verification: Option<String>) {
        debug_assert!(status.is_terminal());
        self.mutate(|record| {
            record.status = status;
            record.finished_at = Some(Utc::now());
            record.current_step = None;
            if verification.is_some() {
                record.verification = verification;
            }
        });
    }
}
