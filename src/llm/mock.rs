//! Deterministic in-process backend for tests and offline runs.
//!
//! Replies come from, in order: the scripted queue, an exact-match map on
//! the last message, a response function, and finally a default text.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ConfigError;

use super::factory::ClientFactory;
use super::{
    emit, ChatMessage, ChatRequest, LlmClient, LlmError, LlmFunctionCall, LlmResponse,
    MalformedCall, StreamEvent, ToolCall, UsageCounter, UsageLedger,
};

type ResponseFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    /// A single tool call with JSON arguments
    ToolCall { name: String, arguments: Value },
    /// Several tool calls in one turn
    ToolCalls(Vec<(String, Value)>),
    /// A tool call whose argument blob is passed through as-is
    RawToolCall { name: String, raw_arguments: String },
    /// Full control over the reply
    Response(LlmResponse),
    Error(LlmError),
    /// Never completes; for exercising cancellation
    Hang,
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    pub fn tool(name: impl Into<String>, arguments: Value) -> Self {
        MockReply::ToolCall {
            name: name.into(),
            arguments,
        }
    }
}

/// Scripted language model.
pub struct MockLm {
    model: String,
    script: Mutex<VecDeque<MockReply>>,
    responses: HashMap<String, String>,
    response_fn: Option<ResponseFn>,
    default_response: String,
    usage: Option<UsageCounter>,
    ledger: Option<Arc<UsageLedger>>,
    stream: AtomicBool,
    next_call_id: AtomicU64,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLm {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
            responses: HashMap::new(),
            response_fn: None,
            default_response: "Mock response".to_string(),
            usage: None,
            ledger: None,
            stream: AtomicBool::new(false),
            next_call_id: AtomicU64::new(1),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.script_lock().extend(replies);
        self
    }

    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = text.into();
        self
    }

    /// Reply `response` whenever the last message is exactly `prompt`.
    pub fn with_response(mut self, prompt: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.insert(prompt.into(), response.into());
        self
    }

    pub fn with_response_fn(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.response_fn = Some(Arc::new(f));
        self
    }

    /// Usage reported by every reply that does not set its own.
    pub fn with_usage(mut self, usage: UsageCounter) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Queue more replies after construction.
    pub fn push(&self, reply: MockReply) {
        self.script_lock().push_back(reply);
    }

    /// Histories of every request received so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn script_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<MockReply>> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn call_id(&self) -> String {
        format!("call_{}", self.next_call_id.fetch_add(1, Ordering::SeqCst))
    }

    fn tool_call(&self, name: String, arguments: Value) -> ToolCall {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        ToolCall::new(self.call_id(), LlmFunctionCall { name, arguments })
    }

    fn unscripted(&self, last: &str) -> String {
        if let Some(text) = self.responses.get(last) {
            return text.clone();
        }
        if let Some(f) = &self.response_fn {
            return f(last);
        }
        self.default_response.clone()
    }

    fn build(&self, reply: MockReply) -> Result<Option<LlmResponse>, LlmError> {
        let response = match reply {
            MockReply::Text(text) => LlmResponse::text(text),
            MockReply::ToolCall { name, arguments } => {
                LlmResponse::text("").with_tool_calls(vec![self.tool_call(name, arguments)])
            }
            MockReply::ToolCalls(calls) => LlmResponse::text("").with_tool_calls(
                calls
                    .into_iter()
                    .map(|(name, args)| self.tool_call(name, args))
                    .collect(),
            ),
            MockReply::RawToolCall {
                name,
                raw_arguments,
            } => {
                let id = self.call_id();
                let mut resp = LlmResponse::text("");
                match LlmFunctionCall::from_raw(name, &raw_arguments) {
                    Ok(function) => resp.tool_calls.push(ToolCall::new(id, function)),
                    Err(error) => resp.malformed_calls.push(MalformedCall { id, error }),
                }
                resp
            }
            MockReply::Response(resp) => resp,
            MockReply::Error(e) => return Err(e),
            MockReply::Hang => return Ok(None),
        };
        Ok(Some(response))
    }

    fn stream_out(&self, request: &ChatRequest, response: &LlmResponse) {
        if !request.streams(self) {
            return;
        }
        let sink = request.sink.as_ref();
        if !response.message.is_empty() {
            emit(sink, StreamEvent::Text(response.message.clone()));
        }
        if let Some(call) = &response.function_call {
            emit(sink, StreamEvent::FunctionName(call.name.clone()));
            emit(sink, StreamEvent::FunctionArgs(call.arguments_value().to_string()));
        }
        for call in &response.tool_calls {
            emit(sink, StreamEvent::ToolName(call.function.name.clone()));
            emit(
                sink,
                StreamEvent::ToolArgs(call.function.arguments_value().to_string()),
            );
        }
    }
}

#[async_trait]
impl LlmClient for MockLm {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<LlmResponse, LlmError> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.messages.clone());

        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let scripted = self.script_lock().pop_front();
        let reply = scripted.unwrap_or_else(|| MockReply::Text(self.unscripted(&last)));

        let Some(mut response) = self.build(reply)? else {
            return futures::future::pending().await;
        };

        if response.usage.is_none() {
            response.usage = self.usage.clone();
        }
        if let Some(usage) = response.usage.as_mut() {
            usage.cost = self.info().cost_usd(usage);
            if let (Some(ledger), false) = (&self.ledger, response.cached) {
                ledger.record(&self.model, usage);
            }
        }

        self.stream_out(&request, &response);
        tracing::debug!(
            model = %self.model,
            calls = response.tool_calls.len(),
            malformed = response.malformed_calls.len(),
            "Mock reply"
        );
        Ok(response)
    }

    fn set_stream(&self, stream: bool) -> bool {
        self.stream.swap(stream, Ordering::SeqCst)
    }

    fn get_stream(&self) -> bool {
        self.stream.load(Ordering::SeqCst)
    }
}

/// Hands out pre-built mock clients by model id.
#[derive(Default)]
pub struct MockFactory {
    clients: HashMap<String, Arc<MockLm>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under its own model id.
    pub fn with(mut self, client: MockLm) -> Self {
        self.clients.insert(client.model.clone(), Arc::new(client));
        self
    }

    /// The registered client, for inspecting what it was sent.
    pub fn get(&self, model: &str) -> Option<Arc<MockLm>> {
        self.clients.get(model).cloned()
    }
}

impl ClientFactory for MockFactory {
    fn client_for(&self, model: &str) -> Result<Arc<dyn LlmClient>, ConfigError> {
        self.clients
            .get(model)
            .map(|c| Arc::clone(c) as Arc<dyn LlmClient>)
            .ok_or_else(|| ConfigError::InvalidValue("model".to_string(), model.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StreamSink;
    use serde_json::json;

    fn req(text: &str) -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn test_reply_sources_in_order() {
        let lm = MockLm::new("mock")
            .with_script([MockReply::text("scripted")])
            .with_response("2+2", "4")
            .with_default_response("default");

        assert_eq!(lm.chat(req("2+2")).await.unwrap().message, "scripted");
        assert_eq!(lm.chat(req("2+2")).await.unwrap().message, "4");
        assert_eq!(lm.chat(req("other")).await.unwrap().message, "default");

        let lm = MockLm::new("mock").with_response_fn(|s| s.to_uppercase());
        assert_eq!(lm.chat(req("shout")).await.unwrap().message, "SHOUT");
    }

    #[tokio::test]
    async fn test_tool_calls_get_distinct_ids() {
        let lm = MockLm::new("mock").with_script([MockReply::ToolCalls(vec![
            ("a".into(), json!({"x": 1})),
            ("b".into(), json!({})),
        ])]);
        let resp = lm.chat(req("go")).await.unwrap();
        assert_eq!(resp.tool_calls.len(), 2);
        assert_ne!(resp.tool_calls[0].id, resp.tool_calls[1].id);
        assert_eq!(resp.tool_calls[0].function.name, "a");
    }

    #[tokio::test]
    async fn test_malformed_raw_call() {
        let lm = MockLm::new("mock").with_script([MockReply::RawToolCall {
            name: "multiply".into(),
            raw_arguments: "[5, 7]".into(),
        }]);
        let resp = lm.chat(req("go")).await.unwrap();
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.malformed_calls.len(), 1);
        assert_eq!(resp.malformed_calls[0].error.name, "multiply");
        assert!(resp.has_calls());
    }

    #[tokio::test]
    async fn test_usage_recorded_unless_cached() {
        let ledger = Arc::new(UsageLedger::new());
        let mut cached = LlmResponse::text("from cache").with_usage(UsageCounter::new(7, 7));
        cached.cached = true;
        let lm = MockLm::new("gpt-4o-mini")
            .with_ledger(ledger.clone())
            .with_usage(UsageCounter::new(100, 50))
            .with_script([
                MockReply::text("one"),
                MockReply::Response(cached),
                MockReply::Error(LlmError::client_error(400, "bad".into())),
            ]);

        lm.chat(req("a")).await.unwrap();
        lm.chat(req("b")).await.unwrap();
        assert!(lm.chat(req("c")).await.is_err());

        let counter = ledger.get("gpt-4o-mini").unwrap();
        assert_eq!(counter.calls, 1);
        assert_eq!(counter.prompt_tokens, 100);
        assert!(counter.cost > 0.0);
    }

    #[tokio::test]
    async fn test_usage_accumulates_across_calls() {
        let ledger = Arc::new(UsageLedger::new());
        let lm = MockLm::new("gpt-4o").with_ledger(ledger.clone()).with_script([
            MockReply::Response(LlmResponse::text("one").with_usage(UsageCounter::new(100, 50))),
            MockReply::Response(LlmResponse::text("two").with_usage(UsageCounter::new(20, 10))),
        ]);

        lm.chat(req("a")).await.unwrap();
        lm.chat(req("b")).await.unwrap();

        let counter = ledger.get("gpt-4o").unwrap();
        assert_eq!(counter.prompt_tokens, 120);
        assert_eq!(counter.completion_tokens, 60);
        assert_eq!(counter.calls, 2);
        let (tokens, cost) = ledger.totals();
        assert_eq!(tokens, 180);
        assert!((cost - counter.cost).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_streams_when_enabled() {
        #[derive(Default)]
        struct Collect(Mutex<Vec<StreamEvent>>);
        impl StreamSink for Collect {
            fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(event.clone());
                Ok(())
            }
        }

        let sink = Arc::new(Collect::default());
        let lm = MockLm::new("mock").with_script([
            MockReply::text("quiet"),
            MockReply::tool("done_tool", json!({"content": "ok"})),
        ]);
        lm.chat(req("x").with_sink(sink.clone())).await.unwrap();
        assert!(sink.0.lock().unwrap().is_empty());

        lm.set_stream(true);
        lm.chat(req("x").with_sink(sink.clone())).await.unwrap();
        let events = sink.0.lock().unwrap().clone();
        assert_eq!(events[0], StreamEvent::ToolName("done_tool".into()));
        assert_eq!(events[1], StreamEvent::ToolArgs(r#"{"content":"ok"}"#.into()));
    }
}
