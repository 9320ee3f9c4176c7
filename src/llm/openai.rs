//! OpenAI-compatible chat-completions client with automatic retry for
//! transient errors and SSE streaming.
//!
//! Works against OpenAI, OpenRouter, Ollama and anything else speaking the
//! same protocol; only the base URL and key differ.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::error::{classify_http_status, LlmError, LlmErrorKind};
use super::response::reasoning_and_final;
use super::retry::{with_retry, RetryConfig};
use super::{
    emit, ChatRequest, LlmClient, LlmFunctionCall, LlmResponse, MalformedCall, StreamEvent,
    StreamSink, ToolCall, UsageCounter, UsageLedger, THOUGHT_DELIMITERS,
};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI-compatible client.
pub struct OpenAiClient {
    client: Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
    retry_config: RetryConfig,
    timeout: Option<Duration>,
    ledger: Option<Arc<UsageLedger>>,
    stream: AtomicBool,
    thought_delimiters: (String, String),
}

impl OpenAiClient {
    /// Create a client for `model` at `base_url` with default retry configuration.
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            retry_config: RetryConfig::default(),
            timeout: None,
            ledger: None,
            stream: AtomicBool::new(false),
            thought_delimiters: (
                THOUGHT_DELIMITERS.0.to_string(),
                THOUGHT_DELIMITERS.1.to_string(),
            ),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_stream(self, stream: bool) -> Self {
        self.stream.store(stream, Ordering::SeqCst);
        self
    }

    pub fn with_thought_delimiters(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.thought_delimiters = (start.into(), end.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|secs| *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Create an LlmError from HTTP response status and body.
    fn create_error(status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            LlmErrorKind::Timeout => LlmError::timeout(format!("HTTP {}: {}", status_code, body)),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    /// Request body in chat-completions format.
    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let info = self.info();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| m.to_wire(&self.model, info.allows_system_message))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !request.tools.is_empty() && info.has_tools {
            body["tools"] = json!(request.tools);
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = choice.to_wire();
            }
        }
        if let Some(format) = &request.response_format {
            body["response_format"] = format.to_wire();
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    /// Execute a single request without retry.
    async fn execute_request(
        &self,
        body: &Value,
        stream: bool,
        sink: Option<&Arc<dyn StreamSink>>,
    ) -> Result<LlmResponse, LlmError> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(Self::create_error(status, &body, retry_after));
        }

        if stream {
            self.read_stream(response, sink).await
        } else {
            let text = response.text().await?;
            let parsed: Value = serde_json::from_str(&text).map_err(|e| {
                LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, text))
            })?;
            parse_completion(&parsed, self.delimiters())
        }
    }

    /// Aggregate an SSE response into a single reply.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        sink: Option<&Arc<dyn StreamSink>>,
    ) -> Result<LlmResponse, LlmError> {
        let mut byte_stream = Box::pin(response.bytes_stream());
        let mut buffer = String::new();
        let mut aggregator = StreamAggregator::default();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let Some(data) = line.trim_end().strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(aggregator.finish(self.delimiters()));
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(event) => aggregator.feed(&event, sink)?,
                    Err(e) => tracing::debug!(error = %e, "Skipping unparseable SSE line"),
                }
            }
        }
        Ok(aggregator.finish(self.delimiters()))
    }

    fn delimiters(&self) -> (&str, &str) {
        (&self.thought_delimiters.0, &self.thought_delimiters.1)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<LlmResponse, LlmError> {
        let stream = request.streams(self);
        let body = self.build_body(&request, stream);
        let sink = request.sink.as_ref();

        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            stream,
            "Sending chat request"
        );

        let mut response = with_retry(&self.retry_config, &self.model, || {
            self.execute_request(&body, stream, sink)
        })
        .await?;

        if let Some(usage) = response.usage.as_mut() {
            usage.cost = self.info().cost_usd(usage);
            if let (Some(ledger), false) = (&self.ledger, response.cached) {
                ledger.record(&self.model, usage);
            }
        }
        Ok(response)
    }

    fn set_stream(&self, stream: bool) -> bool {
        self.stream.swap(stream, Ordering::SeqCst)
    }

    fn get_stream(&self) -> bool {
        self.stream.load(Ordering::SeqCst)
    }

    fn thought_delimiters(&self) -> (&str, &str) {
        self.delimiters()
    }
}

fn parse_usage(usage: &Value) -> Option<UsageCounter> {
    let prompt = usage.get("prompt_tokens")?.as_u64()?;
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let cached = usage
        .pointer("/prompt_tokens_details/cached_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(UsageCounter::new(prompt, completion).with_cached(cached))
}

/// Separate reasoning from the final text, preferring a provider-supplied
/// reasoning field over inline delimiters.
fn split_reasoning(content: String, provided: String, delimiters: (&str, &str)) -> (String, String) {
    if !provided.is_empty() {
        return (provided, content);
    }
    reasoning_and_final(&content, delimiters)
}

/// Convert a non-streamed completion into a reply.
fn parse_completion(body: &Value, delimiters: (&str, &str)) -> Result<LlmResponse, LlmError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let provided_reasoning = message
        .get("reasoning_content")
        .or_else(|| message.get("reasoning"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let (reasoning, text) = split_reasoning(content, provided_reasoning, delimiters);

    let mut response = LlmResponse {
        message: text,
        reasoning,
        usage: body.get("usage").and_then(parse_usage),
        ..LlmResponse::default()
    };

    if let Some(call) = message.get("function_call").filter(|v| !v.is_null()) {
        match LlmFunctionCall::from_wire(call) {
            Ok(call) => response.function_call = Some(call),
            Err(error) => response.malformed_calls.push(MalformedCall {
                id: String::new(),
                error,
            }),
        }
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            match ToolCall::from_wire(call) {
                Ok(tc) => response.tool_calls.push(tc),
                Err(error) => {
                    let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                    tracing::warn!(tool = %error.name, "Model produced malformed tool arguments");
                    response.malformed_calls.push(MalformedCall {
                        id: id.to_string(),
                        error,
                    });
                }
            }
        }
    }
    Ok(response)
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed deltas into one reply.
#[derive(Debug, Default)]
struct StreamAggregator {
    content: String,
    reasoning: String,
    function_call: Option<PartialCall>,
    tool_calls: BTreeMap<u64, PartialCall>,
    usage: Option<UsageCounter>,
}

impl StreamAggregator {
    fn feed(&mut self, event: &Value, sink: Option<&Arc<dyn StreamSink>>) -> Result<(), LlmError> {
        if let Some(error) = event.get("error") {
            return Err(LlmError::server_error(500, format!("Error in stream: {}", error)));
        }
        if let Some(usage) = event.get("usage").and_then(parse_usage) {
            self.usage = Some(usage);
        }
        let Some(delta) = event.pointer("/choices/0/delta") else {
            return Ok(());
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.content.push_str(text);
                emit(sink, StreamEvent::Text(text.to_string()));
            }
        }
        if let Some(text) = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(Value::as_str)
        {
            self.reasoning.push_str(text);
        }
        if let Some(fc) = delta.get("function_call") {
            let partial = self.function_call.get_or_insert_with(PartialCall::default);
            if let Some(name) = fc.get("name").and_then(Value::as_str) {
                partial.name.push_str(name);
                emit(sink, StreamEvent::FunctionName(name.to_string()));
            }
            if let Some(args) = fc.get("arguments").and_then(Value::as_str) {
                partial.arguments.push_str(args);
                emit(sink, StreamEvent::FunctionArgs(args.to_string()));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, call) in calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let partial = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    partial.id.push_str(id);
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    partial.name.push_str(name);
                    emit(sink, StreamEvent::ToolName(name.to_string()));
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                    partial.arguments.push_str(args);
                    emit(sink, StreamEvent::ToolArgs(args.to_string()));
                }
            }
        }
        Ok(())
    }

    fn finish(self, delimiters: (&str, &str)) -> LlmResponse {
        let (reasoning, message) = split_reasoning(self.content, self.reasoning, delimiters);
        let mut response = LlmResponse {
            message,
            reasoning,
            usage: self.usage,
            ..LlmResponse::default()
        };

        if let Some(fc) = self.function_call {
            match LlmFunctionCall::from_raw(fc.name, &fc.arguments) {
                Ok(call) => response.function_call = Some(call),
                Err(error) => response.malformed_calls.push(MalformedCall {
                    id: String::new(),
                    error,
                }),
            }
        }
        for (_, partial) in self.tool_calls {
            match LlmFunctionCall::from_raw(partial.name, &partial.arguments) {
                Ok(function) => response.tool_calls.push(ToolCall::new(partial.id, function)),
                Err(error) => response.malformed_calls.push(MalformedCall {
                    id: partial.id,
                    error,
                }),
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ToolChoice, ToolDefinition};
    use std::sync::Mutex;

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "c1", "type": "function",
                         "function": {"name": "multiply", "arguments": "{\"a\": 5, \"b\": 7}"}},
                        {"id": "c2", "type": "function",
                         "function": {"name": "multiply", "arguments": "[5, 7]"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3,
                      "prompt_tokens_details": {"cached_tokens": 4}}
        });
        let resp = parse_completion(&body, THOUGHT_DELIMITERS).unwrap();
        assert_eq!(resp.message, "");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "c1");
        assert_eq!(resp.malformed_calls.len(), 1);
        assert_eq!(resp.malformed_calls[0].id, "c2");
        assert_eq!(resp.usage, Some(UsageCounter::new(12, 3).with_cached(4)));
    }

    #[test]
    fn test_parse_completion_reasoning() {
        let body = json!({"choices": [{"message": {"content": "<think>hmm</think>42"}}]});
        let resp = parse_completion(&body, THOUGHT_DELIMITERS).unwrap();
        assert_eq!(resp.reasoning, "hmm");
        assert_eq!(resp.message, "42");

        let body = json!({"choices": [{"message": {"content": "42", "reasoning_content": "native"}}]});
        let resp = parse_completion(&body, THOUGHT_DELIMITERS).unwrap();
        assert_eq!(resp.reasoning, "native");
        assert_eq!(resp.message, "42");
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let err = parse_completion(&json!({"choices": []}), THOUGHT_DELIMITERS).unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::ParseError);
    }

    struct Collect(Mutex<Vec<StreamEvent>>);

    impl StreamSink for Collect {
        fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_stream_aggregation() {
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let sink: Arc<dyn StreamSink> = collect.clone();
        let mut agg = StreamAggregator::default();
        let events = [
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "c1", "function": {"name": "done_tool", "arguments": "{\"con"}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "tent\": \"ok\"}"}}]}}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
        ];
        for e in &events {
            agg.feed(e, Some(&sink)).unwrap();
        }
        let resp = agg.finish(THOUGHT_DELIMITERS);
        assert_eq!(resp.message, "Hello");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "c1");
        assert_eq!(
            resp.tool_calls[0].function.arguments_value(),
            json!({"content": "ok"})
        );
        assert_eq!(resp.usage, Some(UsageCounter::new(5, 2)));

        let seen = collect.0.lock().unwrap();
        assert_eq!(seen[0], StreamEvent::Text("Hel".into()));
        assert_eq!(seen[2], StreamEvent::ToolName("done_tool".into()));
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_stream_error_event() {
        let mut agg = StreamAggregator::default();
        let err = agg
            .feed(&json!({"error": {"message": "overloaded"}}), None)
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_build_body() {
        let client = OpenAiClient::new("o1-mini", "http://localhost:11434/v1/");
        assert_eq!(client.base_url(), "http://localhost:11434/v1");

        let request = ChatRequest::new(vec![ChatMessage::system("sys"), ChatMessage::user("hi")])
            .with_tools(
                vec![ToolDefinition::function("done_tool", "finish", json!({"type": "object"}))],
                ToolChoice::Auto,
            )
            .with_max_tokens(100);
        let body = client.build_body(&request, true);
        // o1-mini: no system role, no tools
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("tools").is_none());
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stream"], true);

        let client = OpenAiClient::new("gpt-4o", OPENAI_API_BASE);
        let body = client.build_body(&request, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["function"]["name"], "done_tool");
        assert_eq!(body["tool_choice"], "auto");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "2.5".parse().unwrap());
        assert_eq!(
            OpenAiClient::parse_retry_after(&headers),
            Some(Duration::from_millis(2500))
        );
    }
}
