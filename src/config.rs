use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Default prefixes rejected by the dispatcher's navigation gate. The
/// planner is told to avoid them, but this list is the authoritative check.
pub const DEFAULT_FORBIDDEN_URL_PREFIXES: [&str; 4] =
    ["chrome://", "edge://", "about:", "chrome-extension://"];

/// LLM endpoint configuration. `Debug` redacts the API key.
#[derive(Clone)]
pub struct ModelConfig {
    pub api_key: String,
    pub api_base: String,
    pub model_name: String,
    pub temperature: f32,
    pub request_timeout: Duration,
    pub plan_max_tokens: u32,
    pub verify_max_tokens: u32,
    pub final_max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            model_name: "gpt-4o".to_string(),
            temperature: 0.1,
            request_timeout: Duration::from_secs(30),
            plan_max_tokens: 400,
            verify_max_tokens: 250,
            final_max_tokens: 350,
        }
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("model_name", &self.model_name)
            .field("temperature", &self.temperature)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Process-wide configuration, built once at startup and immutable after.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Hard cap on executed steps per task.
    pub max_steps: u32,
    /// Budget of consecutive failed steps before the task fails.
    pub max_retries: u32,
    /// Deadline applied to each dispatched action.
    pub action_timeout: Duration,
    /// Shorter deadline for the observation sub-calls.
    pub observe_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Soft bound on concurrently in-flight actions on the link.
    pub max_in_flight: usize,
    /// Upper bound on interactive elements kept per observation.
    pub max_elements: usize,
    /// Characters of DOM text handed to the final verifier.
    pub dom_content_limit: usize,
    pub page_settle_delay: Duration,
    pub typing_settle_delay: Duration,
    pub verification_delay: Duration,
    pub capture_final_screenshot: bool,
    pub forbidden_url_prefixes: Vec<String>,
    pub model: ModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            max_steps: 20,
            max_retries: 3,
            action_timeout: Duration::from_secs(20),
            observe_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            max_in_flight: 64,
            max_elements: 30,
            dom_content_limit: 3_000,
            page_settle_delay: Duration::from_secs(2),
            typing_settle_delay: Duration::from_secs(3),
            verification_delay: Duration::from_secs(1),
            capture_final_screenshot: true,
            forbidden_url_prefixes: DEFAULT_FORBIDDEN_URL_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
            model: ModelConfig::default(),
        }
    }
}

impl Config {
    /// Build the configuration from the environment, with `port_override`
    /// taking precedence over `WEBPILOT_PORT`. Fails on missing credentials
    /// or unparseable overrides so startup misconfiguration exits non-zero.
    pub fn from_env(port_override: Option<u16>) -> Result<Self> {
        let mut config = Config::default();

        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!("OPENAI_API_KEY is not set");
        }
        config.model.api_key = api_key;

        if let Ok(base) = std::env::var("OPENAI_API_BASE") {
            if !base.trim().is_empty() {
                config.model.api_base = base.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(model) = std::env::var("MODEL_NAME") {
            if !model.trim().is_empty() {
                config.model.model_name = model.trim().to_string();
            }
        }

        if let Some(steps) = env_parse::<u32>("MAX_STEPS")? {
            if steps == 0 {
                bail!("MAX_STEPS must be at least 1");
            }
            config.max_steps = steps;
        }
        if let Some(retries) = env_parse::<u32>("MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(secs) = env_parse::<u64>("ACTION_TIMEOUT_SECONDS")? {
            if secs == 0 {
                bail!("ACTION_TIMEOUT_SECONDS must be at least 1");
            }
            config.action_timeout = Duration::from_secs(secs);
        }

        if let Some(port) = port_override {
            config.port = port;
        } else if let Some(port) = env_parse::<u16>("WEBPILOT_PORT")? {
            config.port = port;
        }

        if let Ok(extra) = std::env::var("WEBPILOT_FORBIDDEN_URL_PREFIXES") {
            for prefix in extra.split(',') {
                let prefix = prefix.trim();
                if !prefix.is_empty() {
                    config.forbidden_url_prefixes.push(prefix.to_string());
                }
            }
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid {name}: {raw:?}"))?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}
