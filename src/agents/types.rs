//! Core types for the agent system.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::llm::{LlmError, ToolChoice};

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Create a new unique agent ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings for one chat agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,

    pub system_message: String,

    /// Reply sent back to the LLM when it answers in plain text instead of
    /// calling a tool. `None` lets plain answers through.
    pub handle_llm_no_tool: Option<String>,

    /// Send tool schemas through the provider's tools API. When off (or the
    /// model has no tool support) tools are described in the system message
    /// and requested as JSON objects in text.
    pub use_functions_api: bool,

    pub max_output_tokens: Option<u64>,

    pub tool_choice: ToolChoice,

    /// Ask for streamed output (still subject to the global switch)
    pub stream: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "LLM-Agent".to_string(),
            system_message: "You are a helpful assistant.".to_string(),
            handle_llm_no_tool: None,
            use_functions_api: true,
            max_output_tokens: None,
            tool_choice: ToolChoice::Auto,
            stream: true,
        }
    }
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, system_message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_message: system_message.into(),
            ..Self::default()
        }
    }

    pub fn with_handle_llm_no_tool(mut self, reply: impl Into<String>) -> Self {
        self.handle_llm_no_tool = Some(reply.into());
        self
    }

    pub fn with_functions_api(mut self, enabled: bool) -> Self {
        self.use_functions_api = enabled;
        self
    }
}

/// Errors that can occur in agent operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
