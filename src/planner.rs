//! Planner policy: one model call that yields the next single step, or the
//! assertion that the objective is already met. Validation of the returned
//! action and payload happens in the LLM schema layer; the dispatcher remains
//! the authoritative gate for forbidden targets.

use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::ModelError;
use crate::llm::prompt::PlanContext;
use crate::llm::LlmProvider;
use crate::model::{Observation, PlanDecision, StepRecord};

#[derive(Clone)]
pub struct Planner {
    provider: Arc<dyn LlmProvider>,
}

impl Planner {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Ask for the next step. `failure` carries the context of the previous
    /// failed attempt when replanning, so the model adapts instead of
    /// repeating itself.
    pub async fn next(
        &self,
        objective: &str,
        observation: &Observation,
        history: &[StepRecord],
        failure: Option<&str>,
    ) -> Result<PlanDecision, ModelError> {
        let ctx = PlanContext {
            objective,
            observation,
            history,
            failure,
        };
        let decision = self.provider.plan_next(&ctx).await?;
        match &decision {
            PlanDecision::Done { reason } => {
                info!(%reason, "planner reports the objective as met");
            }
            PlanDecision::Step(step) => {
                debug!(action = %step.action, reason = %step.reason, "next step planned");
            }
        }
        Ok(decision)
    }
}
