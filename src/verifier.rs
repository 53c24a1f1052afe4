//! Verifier policy: judge one executed step against its expected outcome,
//! and judge the whole objective at the end of the run.

use std::sync::Arc;

use tracing::debug;

use crate::errors::ModelError;
use crate::llm::prompt::{FinalVerifyContext, StepVerifyContext};
use crate::llm::LlmProvider;
use crate::model::{ModelVerdict, Observation, StepRecord, Verdict};

#[derive(Clone)]
pub struct Verifier {
    provider: Arc<dyn LlmProvider>,
}

impl Verifier {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Judge one executed step by comparing the page before and after it.
    pub async fn check_step(
        &self,
        objective: &str,
        step: &StepRecord,
        before: &Observation,
        after: &Observation,
    ) -> Result<ModelVerdict, ModelError> {
        let ctx = StepVerifyContext {
            objective,
            step,
            before,
            after,
        };
        let verdict = self.provider.verify_step(&ctx).await?;
        debug!(step = step.index, verdict = ?verdict.verdict, "step verified");
        Ok(verdict)
    }

    /// Judge the objective as a whole from the final page state. A `retry`
    /// verdict makes no sense here and is downgraded to `fail`.
    pub async fn check_final(
        &self,
        objective: &str,
        observation: &Observation,
        dom_excerpt: &str,
        history: &[StepRecord],
        screenshot: Option<&str>,
    ) -> Result<ModelVerdict, ModelError> {
        let ctx = FinalVerifyContext {
            objective,
            observation,
            dom_excerpt,
            history,
            screenshot,
        };
        let mut verdict = self.provider.verify_final(&ctx).await?;
        if verdict.verdict == Verdict::Retry {
            verdict.verdict = Verdict::Fail;
        }
        debug!(verdict = ?verdict.verdict, "final verification complete");
        Ok(verdict)
    }
}
