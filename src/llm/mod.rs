//! LLM client module for interacting with language models.
//!
//! This module provides a trait-based abstraction over LLM providers, with
//! an OpenAI-compatible HTTP backend and a scripted mock backend.
//!
//! Backends return a normalized [`LlmResponse`]; retry, streaming and usage
//! accounting happen inside the backend so callers see a single reply or a
//! final [`LlmError`].

mod error;
pub mod factory;
pub mod json;
mod message;
pub mod mock;
mod openai;
mod response;
mod retry;
mod usage;

pub use error::{classify_http_status, CallParseError, LlmError, LlmErrorKind};
pub use factory::{create_client, ClientFactory, LlmConfig, ProviderFactory, ProviderKind};
pub use message::{
    chat_history_components, ChatMessage, FileAttachment, LlmFunctionCall, ResponseFormat, Role,
    ToolCall, ToolChoice, WireError,
};
pub use mock::{MockFactory, MockLm, MockReply};
pub use openai::OpenAiClient;
pub use response::{reasoning_and_final, LlmResponse, MalformedCall};
pub use retry::{with_retry, RetryConfig};
pub use usage::{UsageCounter, UsageLedger};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cost::ModelInfo;

/// Default reasoning delimiters.
pub const THOUGHT_DELIMITERS: (&str, &str) = ("<think>", "</think>");

/// Tool definition for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

/// Function definition with schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Incremental output while a streamed reply is being assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    FunctionName(String),
    FunctionArgs(String),
    ToolName(String),
    ToolArgs(String),
}

/// Receiver of streaming events.
pub trait StreamSink: Send + Sync {
    fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()>;
}

/// Deliver an event; a failing sink is logged and otherwise ignored.
pub(crate) fn emit(sink: Option<&Arc<dyn StreamSink>>, event: StreamEvent) {
    if let Some(sink) = sink {
        if let Err(e) = sink.on_event(&event) {
            tracing::warn!(error = %e, "Stream sink rejected event");
        }
    }
}

/// One chat-completion request.
#[derive(Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u64>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: Option<ResponseFormat>,
    pub sink: Option<Arc<dyn StreamSink>>,
    /// Per-request streaming; `None` defers to the client's flag
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>, choice: ToolChoice) -> Self {
        self.tools = tools;
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Whether `client` should stream this request.
    pub fn streams(&self, client: &dyn LlmClient) -> bool {
        self.stream.unwrap_or_else(|| client.get_stream())
    }
}

impl std::fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRequest")
            .field("messages", &self.messages.len())
            .field("max_tokens", &self.max_tokens)
            .field("tools", &self.tools.len())
            .field("tool_choice", &self.tool_choice)
            .field("response_format", &self.response_format.is_some())
            .field("sink", &self.sink.is_some())
            .field("stream", &self.stream)
            .finish()
    }
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model id requests are sent to.
    fn model(&self) -> &str;

    /// Send a chat completion request.
    ///
    /// Transient failures are retried internally; the error returned is
    /// final. Usage of a successful, non-cached call is recorded before
    /// returning.
    async fn chat(&self, request: ChatRequest) -> Result<LlmResponse, LlmError>;

    /// Enable or disable streaming; returns the previous setting.
    fn set_stream(&self, stream: bool) -> bool;

    fn get_stream(&self) -> bool;

    fn info(&self) -> ModelInfo {
        crate::cost::model_info(self.model())
    }

    fn thought_delimiters(&self) -> (&str, &str) {
        THOUGHT_DELIMITERS
    }

    /// Split a reply into (reasoning, final answer) using this client's
    /// delimiters.
    fn reasoning_and_final(&self, text: &str) -> (String, String) {
        reasoning_and_final(text, self.thought_delimiters())
    }

    /// Synchronous [`chat`](Self::chat) on a private current-thread runtime.
    ///
    /// Must not be called from inside a Tokio runtime.
    fn chat_blocking(&self, request: ChatRequest) -> Result<LlmResponse, LlmError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LlmError::config(format!("Failed to build runtime: {}", e)))?;
        runtime.block_on(self.chat(request))
    }
}

/// Turns streaming on only when both the global setting and the caller
/// allow it; the previous setting is restored on drop.
///
/// The flag lives on the client, so every holder of the same client sees
/// it. Concurrent callers sharing a client should set
/// [`ChatRequest::with_stream`] instead.
pub struct StreamingIfAllowed<'a> {
    client: &'a dyn LlmClient,
    previous: bool,
}

impl<'a> StreamingIfAllowed<'a> {
    pub fn new(client: &'a dyn LlmClient, requested: bool, globally_allowed: bool) -> Self {
        let previous = client.set_stream(globally_allowed && requested);
        Self { client, previous }
    }
}

impl Drop for StreamingIfAllowed<'_> {
    fn drop(&mut self) {
        self.client.set_stream(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<StreamEvent>>);

    impl StreamSink for Collect {
        fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Broken;

    impl StreamSink for Broken {
        fn on_event(&self, _event: &StreamEvent) -> anyhow::Result<()> {
            anyhow::bail!("display went away")
        }
    }

    #[test]
    fn test_emit_tolerates_failing_sink() {
        let broken: Arc<dyn StreamSink> = Arc::new(Broken);
        emit(Some(&broken), StreamEvent::Text("x".into()));

        let collect = Arc::new(Collect::default());
        let sink: Arc<dyn StreamSink> = collect.clone();
        emit(Some(&sink), StreamEvent::ToolName("done_tool".into()));
        emit(None, StreamEvent::Text("ignored".into()));
        assert_eq!(
            *collect.0.lock().unwrap(),
            vec![StreamEvent::ToolName("done_tool".into())]
        );
    }

    #[test]
    fn test_streaming_guard_restores_previous() {
        let client = MockLm::new("mock");
        client.set_stream(true);
        {
            let _guard = StreamingIfAllowed::new(&client, true, false);
            assert!(!client.get_stream());
        }
        assert!(client.get_stream());

        client.set_stream(false);
        {
            let _guard = StreamingIfAllowed::new(&client, true, true);
            assert!(client.get_stream());
        }
        assert!(!client.get_stream());
    }

    #[test]
    fn test_chat_blocking_outside_runtime() {
        let client = MockLm::new("mock").with_default_response("hello");
        let resp = client
            .chat_blocking(ChatRequest::new(vec![ChatMessage::user("hi")]))
            .unwrap();
        assert_eq!(resp.message, "hello");
    }

    #[test]
    fn test_client_reasoning_split() {
        let client = MockLm::new("mock");
        assert_eq!(
            client.reasoning_and_final("<think>plan</think>answer"),
            ("plan".to_string(), "answer".to_string())
        );
    }
}
