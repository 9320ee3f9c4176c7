//! Normalized LLM replies and recipient resolution.

use std::sync::OnceLock;

use regex::Regex;

use super::error::CallParseError;
use super::json::top_level_json_field;
use super::message::{ChatMessage, LlmFunctionCall, ToolCall};
use super::usage::UsageCounter;

/// A structured call whose arguments could not be constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCall {
    /// Tool call id; empty for a legacy function call
    pub id: String,
    pub error: CallParseError,
}

/// A reply from the model, normalized across backends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    pub message: String,
    pub reasoning: String,
    pub function_call: Option<LlmFunctionCall>,
    pub tool_calls: Vec<ToolCall>,
    pub malformed_calls: Vec<MalformedCall>,
    pub usage: Option<UsageCounter>,
    pub cached: bool,
}

impl LlmResponse {
    /// Plain text reply.
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_function_call(mut self, call: LlmFunctionCall) -> Self {
        self.function_call = Some(call);
        self
    }

    pub fn with_usage(mut self, usage: UsageCounter) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Whether the model asked for any call, well-formed or not.
    pub fn has_calls(&self) -> bool {
        self.function_call.is_some() || !self.tool_calls.is_empty() || !self.malformed_calls.is_empty()
    }

    /// Who this reply is addressed to, and the content meant for them.
    ///
    /// A function call wins outright, then the first tool call naming a
    /// `recipient`. Otherwise the text is checked for a `TO: name` or
    /// `TO[name]:` prefix, and finally for a top-level JSON object with a
    /// `recipient` field (in which case the whole text is the content).
    pub fn recipient_and_message(&self) -> (String, String) {
        if let Some(call) = &self.function_call {
            return (call.recipient().to_string(), String::new());
        }

        if let Some(recipient) = self
            .tool_calls
            .iter()
            .map(|tc| tc.function.recipient())
            .find(|r| !r.is_empty())
        {
            return (recipient.to_string(), String::new());
        }

        if let Some((name, rest)) = parse_addressing(&self.message) {
            return (name, rest);
        }

        (
            top_level_json_field(&self.message, "recipient"),
            self.message.clone(),
        )
    }

    /// Assistant turn for this reply, to be appended to a history.
    ///
    /// Malformed tool calls are kept, without arguments, so the error
    /// result sent back for each one answers a call id the provider saw.
    pub fn to_message(&self) -> ChatMessage {
        let mut msg = ChatMessage::assistant(self.message.clone());
        if let Some(call) = &self.function_call {
            msg.name = Some(call.name.clone());
            msg.function_call = Some(call.clone());
        }
        let calls: Vec<ToolCall> = self
            .tool_calls
            .iter()
            .cloned()
            .chain(
                self.malformed_calls
                    .iter()
                    .filter(|m| !m.id.is_empty())
                    .map(|m| {
                        ToolCall::new(
                            m.id.clone(),
                            LlmFunctionCall {
                                name: m.error.name.clone(),
                                arguments: None,
                            },
                        )
                    }),
            )
            .collect();
        if !calls.is_empty() {
            msg.tool_calls = Some(calls);
        }
        msg
    }
}

fn addressing_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?s)^\s*TO\[([^\]\s]+)\]:\s*(.*)$").expect("valid regex"),
            Regex::new(r"(?s)^\s*TO:\s*(\S+)\s*(.*)$").expect("valid regex"),
        ]
    })
}

/// Parse `TO[name]: content` or `TO: name content`.
fn parse_addressing(text: &str) -> Option<(String, String)> {
    addressing_patterns().iter().find_map(|re| {
        let caps = re.captures(text)?;
        let name = caps.get(1)?.as_str().trim_end_matches(':').to_string();
        let rest = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
        Some((name, rest))
    })
}

/// Split `text` into (reasoning, final answer) around a delimited block.
///
/// Only applies when both delimiters are present and the end follows the
/// start; text before the block is kept in the final answer.
pub fn reasoning_and_final(text: &str, delimiters: (&str, &str)) -> (String, String) {
    let (start, end) = delimiters;
    let Some(s) = text.find(start) else {
        return (String::new(), text.to_string());
    };
    let body_start = s + start.len();
    let Some(e) = text[body_start..].find(end).map(|i| i + body_start) else {
        return (String::new(), text.to_string());
    };
    let reasoning = text[body_start..e].to_string();
    let final_answer = format!("{}{}", &text[..s], &text[e + end.len()..]);
    (reasoning, final_answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn call(name: &str, args: Value) -> LlmFunctionCall {
        match args {
            Value::Object(m) => LlmFunctionCall::new(name, m),
            _ => panic!("args must be an object"),
        }
    }

    #[test]
    fn test_tool_call_recipient_beats_text_addressing() {
        let resp = LlmResponse::text("TO: Y hello")
            .with_tool_calls(vec![ToolCall::new("c1", call("send", json!({"recipient": "X"})))]);
        assert_eq!(resp.recipient_and_message(), ("X".to_string(), String::new()));
    }

    #[test]
    fn test_function_call_recipient_beats_text_addressing() {
        let resp = LlmResponse::text("TO: Y hello").with_function_call(call("f", json!({"recipient": "X"})));
        assert_eq!(resp.recipient_and_message(), ("X".to_string(), String::new()));
    }

    #[test]
    fn test_malformed_calls_stay_in_assistant_turn() {
        let mut resp = LlmResponse::text("").with_tool_calls(vec![ToolCall::new("c1", call("f", json!({})))]);
        resp.malformed_calls.push(MalformedCall {
            id: "c2".to_string(),
            error: CallParseError {
                name: "g".to_string(),
                raw_arguments: "[1, 2]".to_string(),
                reason: "expected a JSON object, got array".to_string(),
            },
        });
        let calls = resp.to_message().tool_calls.unwrap();
        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(calls[1].function.name, "g");
        assert!(calls[1].function.arguments.is_none());
    }

    #[test]
    fn test_function_call_wins_even_without_recipient() {
        let resp = LlmResponse::text("TO: Y hello").with_function_call(call("f", json!({"a": 1})));
        assert_eq!(resp.recipient_and_message(), (String::new(), String::new()));

        let resp = LlmResponse::text("").with_function_call(call("f", json!({"recipient": "Z"})));
        assert_eq!(resp.recipient_and_message(), ("Z".to_string(), String::new()));
    }

    #[test]
    fn test_tool_calls_without_recipient_fall_through_to_text() {
        let resp = LlmResponse::text("TO: Y hi there")
            .with_tool_calls(vec![ToolCall::new("c1", call("send", json!({"x": 1})))]);
        assert_eq!(resp.recipient_and_message(), ("Y".to_string(), "hi there".to_string()));
    }

    #[test]
    fn test_bracket_addressing() {
        let resp = LlmResponse::text("TO[Calculator]: what is 2+2?");
        assert_eq!(
            resp.recipient_and_message(),
            ("Calculator".to_string(), "what is 2+2?".to_string())
        );
    }

    #[test]
    fn test_json_recipient_keeps_whole_text() {
        let text = r#"Here: {"recipient": "Bob", "request": "ask"}"#;
        let resp = LlmResponse::text(text);
        assert_eq!(resp.recipient_and_message(), ("Bob".to_string(), text.to_string()));
    }

    #[test]
    fn test_no_recipient() {
        let resp = LlmResponse::text("just an answer");
        assert_eq!(
            resp.recipient_and_message(),
            (String::new(), "just an answer".to_string())
        );
    }

    #[test]
    fn test_reasoning_extraction() {
        let delims = ("<think>", "</think>");
        assert_eq!(
            reasoning_and_final("<think>R</think>F", delims),
            ("R".to_string(), "F".to_string())
        );
        assert_eq!(
            reasoning_and_final("pre <think>R</think> post", delims),
            ("R".to_string(), "pre  post".to_string())
        );
        assert_eq!(
            reasoning_and_final("no delimiters", delims),
            (String::new(), "no delimiters".to_string())
        );
        assert_eq!(
            reasoning_and_final("</think>backwards<think>", delims),
            (String::new(), "</think>backwards<think>".to_string())
        );
    }

    #[test]
    fn test_to_message_carries_calls() {
        let resp = LlmResponse::text("")
            .with_function_call(call("f", json!({"a": 1})));
        let msg = resp.to_message();
        assert_eq!(msg.name.as_deref(), Some("f"));
        assert!(msg.has_calls());
        assert!(msg.tool_calls.is_none());
    }
}
