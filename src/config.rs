//! Model-call configuration and environment settings.
//!
//! [`LlmConfig`] carries the opaque sampling parameters passed through to the
//! backend. [`Settings`] is the explicit configuration value read from the
//! environment (optionally via a `.env` file) and threaded into every
//! [`ExecCtx`] and [`ChatModel`]. There is no process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackoffConfig, OpenAiBackend};
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::model::ChatModel;
use crate::PipelineError;

/// Sampling parameters for a model call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,

    /// Maximum tokens to generate. `None` leaves it to the provider.
    pub max_tokens: Option<u32>,

    /// Request JSON format output from the model.
    pub json_mode: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            json_mode: false,
        }
    }
}

impl LlmConfig {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }
}

pub const ENV_BASE_URL: &str = "LLM_BASE_URL";
pub const ENV_API_KEY: &str = "LLM_API_KEY";
pub const ENV_MODEL: &str = "LLM_MODEL";
pub const ENV_TIMEOUT_SECS: &str = "LLM_TIMEOUT_SECS";
pub const ENV_MAX_RETRIES: &str = "LLM_MAX_RETRIES";
pub const ENV_TEMPERATURE: &str = "LLM_TEMPERATURE";
pub const ENV_MAX_TOKENS: &str = "LLM_MAX_TOKENS";
pub const ENV_AGENT_MAX_ITERATIONS: &str = "AGENT_MAX_ITERATIONS";

/// Connection and budget settings for a model provider.
///
/// # Example
///
/// ```
/// use llm_runnables::config::Settings;
///
/// let settings = Settings::from_lookup(|key| match key {
///     "LLM_BASE_URL" => Some("https://api.deepseek.com".to_string()),
///     "LLM_API_KEY" => Some("sk-test".to_string()),
///     "LLM_MODEL" => Some("deepseek-chat".to_string()),
///     _ => None,
/// })
/// .unwrap();
/// assert_eq!(settings.max_retries, 2);
/// assert_eq!(settings.max_iterations, 5);
/// ```
#[derive(Clone)]
pub struct Settings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Per-call timeout applied to every model request. Default: 60s.
    pub timeout: Duration,
    /// Transport retries after the first attempt. Default: 2.
    pub max_retries: u32,
    /// Agent iteration budget. Default: 5.
    pub max_iterations: usize,
    /// Default: 0.0.
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("max_iterations", &self.max_iterations)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl Settings {
    /// Read settings from the process environment, loading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(PipelineError::InvalidConfig(format!(
                    "failed to load .env: {}",
                    e
                )));
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| -> Result<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(PipelineError::MissingConfig(key))
        };

        Ok(Self {
            base_url: required(ENV_BASE_URL)?,
            api_key: required(ENV_API_KEY)?,
            model: required(ENV_MODEL)?,
            timeout: Duration::from_secs(parse_or(&lookup, ENV_TIMEOUT_SECS, 60)?),
            max_retries: parse_or(&lookup, ENV_MAX_RETRIES, 2)?,
            max_iterations: parse_or(&lookup, ENV_AGENT_MAX_ITERATIONS, 5)?,
            temperature: parse_or(&lookup, ENV_TEMPERATURE, 0.0)?,
            max_tokens: parse_opt(&lookup, ENV_MAX_TOKENS)?,
        })
    }

    /// Transport retry policy derived from `max_retries`.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            max_retries: self.max_retries,
            ..BackoffConfig::interactive()
        }
    }

    /// Build an execution context talking to the configured OpenAI-compatible endpoint.
    pub fn exec_ctx(&self) -> Result<ExecCtx> {
        ExecCtx::builder(&self.base_url)
            .backend(Arc::new(
                OpenAiBackend::new().with_api_key(self.api_key.clone()),
            ))
            .timeout(self.timeout)
            .backoff(self.backoff())
            .build()
    }

    /// Sampling parameters derived from these settings.
    pub fn llm_config(&self) -> LlmConfig {
        let config = LlmConfig::default().with_temperature(self.temperature);
        match self.max_tokens {
            Some(tokens) => config.with_max_tokens(tokens),
            None => config,
        }
    }

    /// A chat model stage for the configured model name.
    pub fn chat_model(&self) -> ChatModel {
        ChatModel::new(&self.model).with_config(self.llm_config())
    }
}

fn parse_opt<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v.parse::<T>().map(Some).map_err(|e| {
            PipelineError::InvalidConfig(format!("{} = {:?}: {}", key, v, e))
        }),
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("LLM_BASE_URL", "https://api.deepseek.com/v1"),
        ("LLM_API_KEY", "sk-abcdef123456"),
        ("LLM_MODEL", "deepseek-chat"),
    ];

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::from_lookup(lookup_from(&REQUIRED)).unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(60));
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.max_iterations, 5);
        assert_eq!(settings.temperature, 0.0);
        assert_eq!(settings.max_tokens, None);
    }

    #[test]
    fn test_missing_credential() {
        let err = Settings::from_lookup(lookup_from(&[
            ("LLM_BASE_URL", "http://localhost:8000"),
            ("LLM_MODEL", "m"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingConfig("LLM_API_KEY")));
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut pairs = REQUIRED.to_vec();
        pairs[2] = ("LLM_MODEL", "   ");
        let err = Settings::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, PipelineError::MissingConfig("LLM_MODEL")));
    }

    #[test]
    fn test_overrides_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("LLM_TIMEOUT_SECS", "5"),
            ("LLM_MAX_RETRIES", "0"),
            ("AGENT_MAX_ITERATIONS", "3"),
            ("LLM_TEMPERATURE", "0.4"),
            ("LLM_MAX_TOKENS", "512"),
        ]);
        let settings = Settings::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.max_iterations, 3);
        assert_eq!(settings.llm_config().temperature, 0.4);
        assert_eq!(settings.llm_config().max_tokens, Some(512));
        assert_eq!(settings.backoff().max_retries, 0);
    }

    #[test]
    fn test_non_numeric_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LLM_MAX_RETRIES", "many"));
        let err = Settings::from_lookup(lookup_from(&pairs)).unwrap_err();
        match err {
            PipelineError::InvalidConfig(msg) => assert!(msg.contains("LLM_MAX_RETRIES")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_debug_redacts_key() {
        let settings = Settings::from_lookup(lookup_from(&REQUIRED)).unwrap();
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("abcdef123456"));
    }

    #[test]
    fn test_exec_ctx_uses_openai_backend() {
        let settings = Settings::from_lookup(lookup_from(&REQUIRED)).unwrap();
        let ctx = settings.exec_ctx().unwrap();
        assert_eq!(ctx.backend.name(), "openai");
        assert_eq!(ctx.base_url, "https://api.deepseek.com");
        assert_eq!(ctx.timeout, Duration::from_secs(60));
        assert_eq!(ctx.backoff.max_retries, 2);
    }

    #[test]
    fn test_llm_config_builder() {
        let config = LlmConfig::default()
            .with_temperature(0.3)
            .with_max_tokens(4096)
            .with_json_mode(true);
        assert_eq!(config.temperature, 0.3);
        assert_eq!(config.max_tokens, Some(4096));
        assert!(config.json_mode);
    }
}
