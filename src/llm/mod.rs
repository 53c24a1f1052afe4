//! LLM client: the provider seam used by the planner and verifier, and the
//! OpenAI-compatible implementation with strict JSON handling and bounded
//! repair retries.

pub mod prompt;
pub mod schema;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::errors::ModelError;
use crate::model::{ModelVerdict, PlanDecision};
use prompt::{FinalVerifyContext, PlanContext, StepVerifyContext};

/// Extra attempts granted when a completion fails the JSON contract.
const REPAIR_RETRIES: usize = 2;

/// Seam between the engine's policies and the model. Production uses
/// [`OpenAiProvider`]; tests script the decisions directly.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn plan_next(&self, ctx: &PlanContext<'_>) -> Result<PlanDecision, ModelError>;
    async fn verify_step(&self, ctx: &StepVerifyContext<'_>) -> Result<ModelVerdict, ModelError>;
    async fn verify_final(&self, ctx: &FinalVerifyContext<'_>) -> Result<ModelVerdict, ModelError>;
}

pub struct OpenAiProvider {
    client: Client,
    config: ModelConfig,
}

impl OpenAiProvider {
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ModelError::Http(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    /// Run one completion request and parse it under the strict JSON
    /// contract. On a contract violation the offending output is fed back
    /// with a repair instruction, up to [`REPAIR_RETRIES`] times.
    async fn request_json<T>(
        &self,
        system: String,
        user: Value,
        max_tokens: u32,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Result<T, ModelError> {
        let mut messages = vec![
            ChatMessage {
                role: "system",
                content: Value::String(system),
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ];

        let mut last_error = String::new();
        for attempt in 0..=REPAIR_RETRIES {
            let content = self.complete(&messages, max_tokens).await?;
            match parse(&content) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(attempt, error = %err, "model output violated the JSON contract");
                    last_error = err.clone();
                    messages.push(ChatMessage {
                        role: "assistant",
                        content: Value::String(content),
                    });
                    messages.push(ChatMessage {
                        role: "user",
                        content: Value::String(format!(
                            "Your previous reply was rejected: {err}. Respond again with ONLY the \
                             required JSON object on a single line, nothing else."
                        )),
                    });
                }
            }
        }
        Err(ModelError::Parse(last_error))
    }

    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String, ModelError> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let body = ChatCompletionRequest {
            model: &self.config.model_name,
            temperature: self.config.temperature,
            max_tokens,
            response_format: ResponseFormat {
                r#type: "json_object",
            },
            messages,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ModelError::http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let body: String = body.trim().chars().take(400).collect();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ModelError::Http(format!("invalid completion body: {err}")))?;
        let content = completion
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_text())
            .ok_or(ModelError::MissingContent)?;
        debug!(chars = content.len(), "model completion received");
        Ok(content)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn plan_next(&self, ctx: &PlanContext<'_>) -> Result<PlanDecision, ModelError> {
        self.request_json(
            prompt::plan_system_prompt(),
            Value::String(prompt::plan_user_prompt(ctx)),
            self.config.plan_max_tokens,
            schema::parse_plan,
        )
        .await
    }

    async fn verify_step(&self, ctx: &StepVerifyContext<'_>) -> Result<ModelVerdict, ModelError> {
        self.request_json(
            prompt::step_verify_system_prompt(),
            Value::String(prompt::step_verify_user_prompt(ctx)),
            self.config.verify_max_tokens,
            schema::parse_verdict,
        )
        .await
    }

    async fn verify_final(&self, ctx: &FinalVerifyContext<'_>) -> Result<ModelVerdict, ModelError> {
        let text = prompt::final_verify_user_prompt(ctx);
        // Vision-capable models get the screenshot as an image part.
        let user = match ctx.screenshot {
            Some(shot) => json!([
                {"type": "text", "text": text},
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:image/png;base64,{shot}"),
                        "detail": "high",
                    },
                },
            ]),
            None => Value::String(text),
        };
        self.request_json(
            prompt::final_verify_system_prompt(),
            user,
            self.config.final_max_tokens,
            schema::parse_verdict,
        )
        .await
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
    messages: &'a [ChatMessage],
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Serialize, Clone)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: ChatCompletionContent,
}

/// Some OpenAI-compatible endpoints return content as a string, others as a
/// list of typed parts.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChatCompletionContent {
    Text(String),
    Parts(Vec<ChatCompletionPart>),
}

impl ChatCompletionContent {
    fn as_text(&self) -> Option<String> {
        match self {
            ChatCompletionContent::Text(value) => Some(value.clone()),
            ChatCompletionContent::Parts(parts) => {
                let text = parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionPart {
    #[serde(default)]
    text: Option<String>,
}
