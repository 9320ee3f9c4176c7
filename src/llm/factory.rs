//! Building clients from configuration.

use std::sync::Arc;
use std::time::Duration;

use super::mock::MockLm;
use super::openai::{OpenAiClient, OPENAI_API_BASE};
use super::retry::RetryConfig;
use super::{LlmClient, UsageLedger, THOUGHT_DELIMITERS};
use crate::config::ConfigError;

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
const OLLAMA_API_BASE: &str = "http://localhost:11434/v1";

/// Which backend a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    OpenRouter,
    Ollama,
    Mock,
}

impl ProviderKind {
    /// Parse a provider type tag. An empty or `generic` tag names no
    /// concrete backend and is rejected.
    pub fn parse(tag: &str) -> Result<Self, ConfigError> {
        match tag.trim().to_lowercase().as_str() {
            "" | "generic" => Err(ConfigError::AbstractModelConfig(tag.to_string())),
            "openai" => Ok(ProviderKind::OpenAi),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "ollama" => Ok(ProviderKind::Ollama),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }

    fn default_base(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => OPENAI_API_BASE,
            ProviderKind::OpenRouter => OPENROUTER_API_BASE,
            ProviderKind::Ollama | ProviderKind::Mock => OLLAMA_API_BASE,
        }
    }

    fn requires_key(&self) -> bool {
        matches!(self, ProviderKind::OpenAi | ProviderKind::OpenRouter)
    }
}

/// Settings for one language model client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Provider type tag: openai, openrouter, ollama or mock
    pub provider: String,
    pub chat_model: String,
    pub api_key: Option<String>,
    /// Overrides the provider's default endpoint
    pub api_base: Option<String>,
    /// Global streaming switch
    pub stream: bool,
    /// Suppress streaming for async callers
    pub async_stream_quiet: bool,
    pub max_output_tokens: Option<u64>,
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub thought_delimiters: (String, String),
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            chat_model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_base: None,
            stream: false,
            async_stream_quiet: true,
            max_output_tokens: None,
            timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            thought_delimiters: (
                THOUGHT_DELIMITERS.0.to_string(),
                THOUGHT_DELIMITERS.1.to_string(),
            ),
        }
    }
}

impl LlmConfig {
    pub fn mock(model: impl Into<String>) -> Self {
        Self {
            provider: "mock".to_string(),
            chat_model: model.into(),
            ..Self::default()
        }
    }

    /// Same settings, different model.
    pub fn for_model(&self, model: &str) -> Self {
        Self {
            chat_model: model.to_string(),
            ..self.clone()
        }
    }
}

/// Build the client selected by `config.provider`.
pub fn create_client(config: &LlmConfig, ledger: Arc<UsageLedger>) -> Result<Arc<dyn LlmClient>, ConfigError> {
    let kind = ProviderKind::parse(&config.provider)?;
    tracing::debug!(provider = ?kind, model = %config.chat_model, "Creating LLM client");

    if kind == ProviderKind::Mock {
        let client = MockLm::new(config.chat_model.clone()).with_ledger(ledger);
        client.set_stream(config.stream);
        return Ok(Arc::new(client));
    }

    if kind.requires_key() && config.api_key.as_deref().map_or(true, str::is_empty) {
        return Err(ConfigError::MissingApiKey(config.provider.clone()));
    }

    let base = config
        .api_base
        .clone()
        .unwrap_or_else(|| kind.default_base().to_string());
    let client = OpenAiClient::new(config.chat_model.clone(), base)
        .with_api_key(config.api_key.clone())
        .with_retry_config(config.retry.clone())
        .with_timeout(config.timeout)
        .with_ledger(ledger)
        .with_stream(config.stream)
        .with_thought_delimiters(
            config.thought_delimiters.0.clone(),
            config.thought_delimiters.1.clone(),
        );
    Ok(Arc::new(client))
}

/// Builds clients for model ids named at run time (e.g. by a delegation call).
pub trait ClientFactory: Send + Sync {
    /// Client for `model`; an empty id means the factory's default model.
    fn client_for(&self, model: &str) -> Result<Arc<dyn LlmClient>, ConfigError>;
}

/// Reuses one provider configuration for every model.
pub struct ProviderFactory {
    base: LlmConfig,
    ledger: Arc<UsageLedger>,
}

impl ProviderFactory {
    pub fn new(base: LlmConfig, ledger: Arc<UsageLedger>) -> Self {
        Self { base, ledger }
    }
}

impl ClientFactory for ProviderFactory {
    fn client_for(&self, model: &str) -> Result<Arc<dyn LlmClient>, ConfigError> {
        let config = if model.is_empty() {
            self.base.clone()
        } else {
            self.base.for_model(model)
        };
        create_client(&config, Arc::clone(&self.ledger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_tag_is_a_config_error() {
        let ledger = Arc::new(UsageLedger::new());
        for tag in ["", "generic", "  Generic "] {
            let config = LlmConfig {
                provider: tag.to_string(),
                ..LlmConfig::default()
            };
            assert!(matches!(
                create_client(&config, ledger.clone()),
                Err(ConfigError::AbstractModelConfig(_))
            ));
        }
    }

    #[test]
    fn test_unknown_provider() {
        assert!(matches!(
            ProviderKind::parse("azure-ish"),
            Err(ConfigError::UnknownProvider(_))
        ));
        assert_eq!(ProviderKind::parse("OpenAI").unwrap(), ProviderKind::OpenAi);
    }

    #[test]
    fn test_hosted_providers_need_a_key() {
        let config = LlmConfig {
            provider: "openrouter".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            create_client(&config, Arc::new(UsageLedger::new())),
            Err(ConfigError::MissingApiKey(_))
        ));

        let config = LlmConfig {
            provider: "ollama".to_string(),
            chat_model: "llama3.2".to_string(),
            ..LlmConfig::default()
        };
        let client = create_client(&config, Arc::new(UsageLedger::new())).unwrap();
        assert_eq!(client.model(), "llama3.2");
    }

    #[test]
    fn test_provider_factory_swaps_model() {
        let factory = ProviderFactory::new(LlmConfig::mock("base-model"), Arc::new(UsageLedger::new()));
        assert_eq!(factory.client_for("").unwrap().model(), "base-model");
        assert_eq!(factory.client_for("other").unwrap().model(), "other");
    }
}
