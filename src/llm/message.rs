//! Conversation turns and their OpenAI chat-completions wire form.
//!
//! A [`ChatMessage`] carries a few fields that only matter inside this
//! crate (`tool_id`, `timestamp`, `document_id`); [`ChatMessage::to_wire`]
//! drops them so the provider only sees what the API accepts.

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::CallParseError;
use super::json::parse_tolerant_json;

/// Prefix used when a system turn has to be sent with the user role.
pub const SYSTEM_AS_USER_PREFIX: &str = "[ADDITIONAL SYSTEM MESSAGE:]\n\n";

const PLACEHOLDER_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const PLACEHOLDER_USER_PROMPT: &str = "Follow the instructions above.";

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result of a legacy `function_call`
    Function,
    /// Result of a tool call, linked by `tool_call_id`
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
            Role::Tool => "tool",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "function" => Some(Role::Function),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file sent alongside a user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FileAttachment {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }

    /// Content part for this file. Gemini's OpenAI-compatible endpoint only
    /// accepts inline data through `image_url`, whatever the mime type.
    fn to_content_part(&self, model: &str) -> Value {
        if self.is_image() || model.contains("gemini") {
            json!({
                "type": "image_url",
                "image_url": { "url": self.data_url() }
            })
        } else {
            json!({
                "type": "file",
                "file": {
                    "filename": self.filename,
                    "file_data": self.data_url(),
                }
            })
        }
    }

    fn from_data_url(filename: &str, url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (mime_type, encoded) = rest.split_once(";base64,")?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        Some(Self::new(filename, mime_type, data))
    }

    fn from_content_part(part: &Value) -> Option<Self> {
        match part.get("type")?.as_str()? {
            "image_url" => {
                let url = part.get("image_url")?.get("url")?.as_str()?;
                Self::from_data_url("", url)
            }
            "file" => {
                let file = part.get("file")?;
                let filename = file.get("filename").and_then(Value::as_str).unwrap_or("");
                Self::from_data_url(filename, file.get("file_data")?.as_str()?)
            }
            _ => None,
        }
    }
}

/// A structured call the model wants made.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: Option<Map<String, Value>>,
}

impl LlmFunctionCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments: Some(arguments),
        }
    }

    /// Build a call from the argument blob exactly as a model produced it.
    ///
    /// Newlines and surrounding whitespace are stripped before a lenient
    /// parse. An empty or `null` blob means "no arguments"; anything that
    /// does not come out as a JSON object is an error.
    pub fn from_raw(name: impl Into<String>, raw: &str) -> Result<Self, CallParseError> {
        let name = name.into();
        let cleaned = raw.replace('\n', "");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() || cleaned == "null" {
            return Ok(Self {
                name,
                arguments: None,
            });
        }
        match parse_tolerant_json(cleaned) {
            Ok(Value::Object(map)) => Ok(Self {
                name,
                arguments: Some(map),
            }),
            Ok(Value::Null) => Ok(Self {
                name,
                arguments: None,
            }),
            Ok(other) => Err(CallParseError {
                name,
                raw_arguments: raw.to_string(),
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(CallParseError {
                name,
                raw_arguments: raw.to_string(),
                reason: e.reason,
            }),
        }
    }

    /// Decode `{"name": .., "arguments": ..}` as found in a response.
    pub fn from_wire(value: &Value) -> Result<Self, CallParseError> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match value.get("arguments") {
            None | Some(Value::Null) => Ok(Self {
                name,
                arguments: None,
            }),
            Some(Value::String(raw)) => Self::from_raw(name, raw),
            Some(Value::Object(map)) => Ok(Self {
                name,
                arguments: Some(map.clone()),
            }),
            Some(other) => Err(CallParseError {
                name,
                raw_arguments: other.to_string(),
                reason: format!("expected a JSON object, got {}", json_kind(other)),
            }),
        }
    }

    /// Wire form: arguments are always a JSON string, `"null"` when absent.
    pub fn to_wire(&self) -> Value {
        let arguments = match &self.arguments {
            Some(map) => Value::Object(map.clone()).to_string(),
            None => "null".to_string(),
        };
        json!({ "name": self.name, "arguments": arguments })
    }

    /// The `recipient` argument, or "" when there is none.
    pub fn recipient(&self) -> &str {
        self.arguments
            .as_ref()
            .and_then(|args| args.get("recipient"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Arguments as a JSON value (`{}` when absent).
    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone().unwrap_or_default())
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub function: LlmFunctionCall,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, function: LlmFunctionCall) -> Self {
        Self {
            id: id.into(),
            function,
        }
    }

    pub fn to_wire(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": self.function.to_wire(),
        })
    }

    pub fn from_wire(value: &Value) -> Result<Self, CallParseError> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let function = LlmFunctionCall::from_wire(value.get("function").unwrap_or(&Value::Null))?;
        Ok(Self { id, function })
    }
}

/// Errors decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message has no role")]
    MissingRole,
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error(transparent)]
    Call(#[from] CallParseError),
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub name: Option<String>,
    pub function_call: Option<LlmFunctionCall>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub files: Vec<FileAttachment>,
    pub tool_call_id: Option<String>,
    /// Stateful-assistant linkage; never sent to the provider.
    pub tool_id: String,
    pub timestamp: DateTime<Utc>,
    /// Document this turn was produced from, if any.
    pub document_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_call: None,
            tool_calls: None,
            files: Vec::new(),
            tool_call_id: None,
            tool_id: String::new(),
            timestamp: Utc::now(),
            document_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Result of a tool call, linked back by id.
    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// Result of a legacy function call.
    pub fn function_result(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(Role::Function, content)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_files(mut self, files: Vec<FileAttachment>) -> Self {
        self.files = files;
        self
    }

    pub fn with_function_call(mut self, call: LlmFunctionCall) -> Self {
        self.function_call = Some(call);
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(calls);
        self
    }

    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    /// Whether this turn carries a structured call of either kind.
    pub fn has_calls(&self) -> bool {
        self.function_call.is_some()
            || self.tool_calls.as_ref().map_or(false, |c| !c.is_empty())
    }

    /// Encode for a chat-completions request.
    pub fn to_wire(&self, model: &str, supports_system_role: bool) -> Value {
        let mut obj = Map::new();

        let (role, content) = if self.role == Role::System && !supports_system_role {
            (Role::User, format!("{}{}", SYSTEM_AS_USER_PREFIX, self.content))
        } else {
            (self.role, self.content.clone())
        };
        obj.insert("role".into(), json!(role.as_str()));

        if self.role == Role::User && !self.files.is_empty() {
            let mut parts = vec![json!({ "type": "text", "text": content })];
            parts.extend(self.files.iter().map(|f| f.to_content_part(model)));
            obj.insert("content".into(), Value::Array(parts));
        } else {
            obj.insert("content".into(), Value::String(content));
        }

        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            obj.insert("name".into(), json!(name));
        }
        if let Some(call) = &self.function_call {
            obj.insert("function_call".into(), call.to_wire());
        }
        if let Some(calls) = &self.tool_calls {
            obj.insert(
                "tool_calls".into(),
                Value::Array(calls.iter().map(ToolCall::to_wire).collect()),
            );
        }
        if let Some(id) = &self.tool_call_id {
            obj.insert("tool_call_id".into(), json!(id));
        }
        Value::Object(obj)
    }

    /// Decode a chat-completions message object.
    pub fn from_wire(value: &Value) -> Result<Self, WireError> {
        let role_str = value
            .get("role")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingRole)?;
        let role = Role::parse(role_str).ok_or_else(|| WireError::UnknownRole(role_str.to_string()))?;

        let mut files = Vec::new();
        let content = match value.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => {
                let mut text = String::new();
                for part in parts {
                    if part.get("type").and_then(Value::as_str) == Some("text") {
                        text.push_str(part.get("text").and_then(Value::as_str).unwrap_or(""));
                    } else if let Some(file) = FileAttachment::from_content_part(part) {
                        files.push(file);
                    }
                }
                text
            }
            _ => String::new(),
        };

        let function_call = value
            .get("function_call")
            .filter(|v| !v.is_null())
            .map(LlmFunctionCall::from_wire)
            .transpose()?;
        let tool_calls = match value.get("tool_calls") {
            Some(Value::Array(calls)) => Some(
                calls
                    .iter()
                    .map(ToolCall::from_wire)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => None,
        };

        Ok(Self {
            name: value.get("name").and_then(Value::as_str).map(str::to_string),
            function_call,
            tool_calls,
            files,
            tool_call_id: value
                .get("tool_call_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Self::new(role, content)
        })
    }
}

impl std::fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.name.as_deref() {
            Some(n) if !n.is_empty() => format!(" ({})", n),
            _ => String::new(),
        };
        match &self.function_call {
            Some(call) => write!(f, "{}{}: FUNC: {}", self.role, name, call.to_wire()),
            None => write!(f, "{}{}: {}", self.role, name, self.content),
        }
    }
}

/// Forced or suggested tool use for a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    None,
    #[default]
    Auto,
    Required,
    /// Force a specific function by name
    Function(String),
}

impl ToolChoice {
    pub fn to_wire(&self) -> Value {
        match self {
            ToolChoice::None => json!("none"),
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Function(name) => json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }
}

/// Structured-output constraint for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
    pub strict: bool,
}

impl ResponseFormat {
    pub fn json_schema(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            strict: true,
        }
    }

    pub fn to_wire(&self) -> Value {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": self.name,
                "schema": self.schema,
                "strict": self.strict,
            }
        })
    }
}

/// Split a history into (system prompt, user/assistant pairs, final user
/// message) for completion-style backends.
///
/// Missing pieces are filled with placeholder prompts so that the shape is
/// always `[system, user, (assistant, user)*]`.
pub fn chat_history_components(messages: &[ChatMessage]) -> (String, Vec<(String, String)>, String) {
    let mut msgs: Vec<(Role, String)> = messages
        .iter()
        .map(|m| (m.role, m.content.clone()))
        .collect();

    if msgs.first().map(|(r, _)| *r) != Some(Role::System) {
        tracing::warn!("No system message in history, using a placeholder");
        msgs.insert(0, (Role::System, PLACEHOLDER_SYSTEM_PROMPT.to_string()));
    }
    if msgs.len() == 1 {
        tracing::warn!("History has only a system message, adding a placeholder user prompt");
        msgs.push((Role::User, PLACEHOLDER_USER_PROMPT.to_string()));
    }
    if msgs[1].0 != Role::User {
        msgs.insert(1, (Role::User, PLACEHOLDER_USER_PROMPT.to_string()));
    }
    if msgs.last().map(|(r, _)| *r) != Some(Role::User) {
        tracing::warn!("Last message in history is not from the user, adding a placeholder");
        msgs.push((Role::User, PLACEHOLDER_USER_PROMPT.to_string()));
    }

    let system = msgs[0].1.clone();
    let last = msgs[msgs.len() - 1].1.clone();
    let middle: Vec<String> = msgs[1..msgs.len() - 1].iter().map(|(_, c)| c.clone()).collect();
    let pairs = middle
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    (system, pairs, last)
}
