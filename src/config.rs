//! Configuration management for tasklink.
//!
//! Configuration can be set via environment variables:
//! - `TASKLINK_PROVIDER` - Provider type tag (`openai`, `openrouter`, `ollama`, `mock`). Required.
//! - `TASKLINK_API_KEY` / `OPENAI_API_KEY` - API key for hosted providers.
//! - `TASKLINK_API_BASE` - Optional. Overrides the provider's endpoint.
//! - `DEFAULT_MODEL` - Optional. Defaults to `gpt-4o-mini`.
//! - `MAX_TURNS` - Optional. Turn ceiling for the root task. Defaults to `30`.
//! - `TASKLINK_MAX_DEPTH` - Optional. Delegation depth cap. Defaults to `5`.
//! - `TASKLINK_STREAM` - Optional. Global streaming switch. Defaults to `false`.
//! - `TASKLINK_ASYNC_STREAM_QUIET` - Optional. Suppress streaming in async runs. Defaults to `true`.
//! - `TASKLINK_MAX_RETRIES` - Optional. Defaults to `5`.
//! - `TASKLINK_TIMEOUT_SECS` - Optional. Per-request timeout. Defaults to `60`.
//! - `TASKLINK_MAX_OUTPUT_TOKENS` - Optional.
//! - `TASKLINK_THOUGHT_DELIMITERS` - Optional. `start,end`, e.g. `<think>,</think>`.
//! - `TASKLINK_INTERACTIVE` - Optional. Read user turns from stdin. Defaults to `false`.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::llm::{LlmConfig, RetryConfig, THOUGHT_DELIMITERS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Provider tag {0:?} does not name a concrete backend")]
    AbstractModelConfig(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider {0} requires an API key")]
    MissingApiKey(String),
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider type tag
    pub provider: String,

    pub api_key: Option<String>,

    pub api_base: Option<String>,

    /// Default LLM model identifier
    pub default_model: String,

    /// Turn ceiling for the root task
    pub max_turns: usize,

    /// Maximum delegation depth
    pub max_depth: usize,

    pub stream: bool,

    pub async_stream_quiet: bool,

    pub max_retries: u32,

    pub timeout: Duration,

    pub max_output_tokens: Option<u64>,

    pub thought_delimiters: (String, String),

    /// Read user turns from stdin
    pub interactive: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `TASKLINK_PROVIDER` is not set,
    /// `ConfigError::InvalidValue` if a numeric or boolean variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let provider = lookup("TASKLINK_PROVIDER")
            .ok_or_else(|| ConfigError::MissingEnvVar("TASKLINK_PROVIDER".to_string()))?;

        let api_key = lookup("TASKLINK_API_KEY")
            .or_else(|| lookup("OPENAI_API_KEY"))
            .filter(|k| !k.is_empty());

        let default_model = lookup("DEFAULT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let max_turns = parse_or(&lookup, "MAX_TURNS", 30)?;
        let max_depth = parse_or(&lookup, "TASKLINK_MAX_DEPTH", 5)?;
        let stream = parse_flag(&lookup, "TASKLINK_STREAM", false)?;
        let async_stream_quiet = parse_flag(&lookup, "TASKLINK_ASYNC_STREAM_QUIET", true)?;
        let max_retries = parse_or(&lookup, "TASKLINK_MAX_RETRIES", 5)?;
        let timeout_secs: u64 = parse_or(&lookup, "TASKLINK_TIMEOUT_SECS", 60)?;
        let interactive = parse_flag(&lookup, "TASKLINK_INTERACTIVE", false)?;

        let max_output_tokens = match lookup("TASKLINK_MAX_OUTPUT_TOKENS") {
            Some(raw) => Some(raw.trim().parse().map_err(|e| {
                ConfigError::InvalidValue("TASKLINK_MAX_OUTPUT_TOKENS".to_string(), format!("{}", e))
            })?),
            None => None,
        };

        let thought_delimiters = match lookup("TASKLINK_THOUGHT_DELIMITERS") {
            Some(raw) => {
                let (start, end) = raw.split_once(',').ok_or_else(|| {
                    ConfigError::InvalidValue(
                        "TASKLINK_THOUGHT_DELIMITERS".to_string(),
                        format!("expected `start,end`, got {:?}", raw),
                    )
                })?;
                (start.trim().to_string(), end.trim().to_string())
            }
            None => default_delimiters(),
        };

        Ok(Self {
            provider,
            api_key,
            api_base: lookup("TASKLINK_API_BASE"),
            default_model,
            max_turns,
            max_depth,
            stream,
            async_stream_quiet,
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
            max_output_tokens,
            thought_delimiters,
            interactive,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api_key: None,
            api_base: None,
            default_model: default_model.into(),
            max_turns: 30,
            max_depth: 5,
            stream: false,
            async_stream_quiet: true,
            max_retries: 5,
            timeout: Duration::from_secs(60),
            max_output_tokens: None,
            thought_delimiters: default_delimiters(),
            interactive: false,
        }
    }

    /// Client settings for the default model.
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            provider: self.provider.clone(),
            chat_model: self.default_model.clone(),
            api_key: self.api_key.clone(),
            api_base: self.api_base.clone(),
            stream: self.stream,
            async_stream_quiet: self.async_stream_quiet,
            max_output_tokens: self.max_output_tokens,
            timeout: self.timeout,
            retry: RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::default()
            },
            thought_delimiters: self.thought_delimiters.clone(),
        }
    }
}

fn default_delimiters() -> (String, String) {
    (
        THOUGHT_DELIMITERS.0.to_string(),
        THOUGHT_DELIMITERS.1.to_string(),
    )
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(name) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(ConfigError::InvalidValue(name.to_string(), other.to_string())),
        },
        None => Ok(default),
    }
}
