//! Chat agent: owns a conversation history, talks to one LLM and executes
//! the tools its scope allows.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::context::TaskContext;
use super::types::{AgentConfig, AgentError, AgentId};
use crate::llm::json::top_level_json_objects;
use crate::llm::{
    ChatMessage, ChatRequest, LlmClient, LlmFunctionCall, LlmResponse, MalformedCall, ToolCall,
};
use crate::task::{ChatDocument, Origin, ToolResult};
use crate::tools::ToolScope;

/// An LLM-backed agent.
pub struct ChatAgent {
    id: AgentId,
    config: AgentConfig,
    llm: Arc<dyn LlmClient>,
    scope: ToolScope,
    history: Vec<ChatMessage>,
    next_request_id: u64,
}

impl ChatAgent {
    /// Create an agent whose history holds only its system turn.
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmClient>, scope: ToolScope) -> Self {
        let mut agent = Self {
            id: AgentId::new(),
            config,
            llm,
            scope,
            history: Vec::new(),
            next_request_id: 1,
        };
        agent.history.push(agent.system_turn());
        agent
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub fn scope(&self) -> &ToolScope {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut ToolScope {
        &mut self.scope
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Append turns produced outside an LLM step.
    pub fn extend_history(&mut self, messages: Vec<ChatMessage>) {
        self.history.extend(messages);
    }

    /// Drop everything but the system turn.
    pub fn clear_history(&mut self) {
        self.history.truncate(1);
    }

    /// Whether tools go through the provider's tools API.
    pub fn uses_tools_api(&self) -> bool {
        self.config.use_functions_api && self.llm.info().has_tools
    }

    fn system_turn(&self) -> ChatMessage {
        if self.uses_tools_api() {
            return ChatMessage::system(self.config.system_message.clone());
        }
        let schemas = self.scope.usable_schemas();
        if schemas.is_empty() {
            return ChatMessage::system(self.config.system_message.clone());
        }

        let mut text = self.config.system_message.clone();
        text.push_str(
            "\n\nYou have access to the following TOOLS. To use one, reply with a JSON \
             object whose `request` field is the tool name, plus the tool's arguments:\n",
        );
        for def in schemas {
            text.push_str(&format!(
                "\n- {}: {}\n  arguments schema: {}",
                def.function.name, def.function.description, def.function.parameters
            ));
        }
        ChatMessage::system(text)
    }

    /// Messages the LLM should see for `doc`.
    pub fn messages_for(&self, doc: &ChatDocument) -> Vec<ChatMessage> {
        let doc_id = doc.id.to_string();
        if doc.tool_results.is_empty() {
            let msg = match doc.origin {
                Origin::Llm => ChatMessage::assistant(doc.content.clone()),
                Origin::Agent | Origin::User | Origin::SubTask => {
                    ChatMessage::user(doc.content.clone())
                }
            };
            return vec![msg.with_document_id(doc_id)];
        }

        doc.tool_results
            .iter()
            .map(|r| {
                let msg = if r.call_id.is_empty() {
                    ChatMessage::function_result(r.name.clone(), r.content.clone())
                } else if self.uses_tools_api() {
                    ChatMessage::tool_result(r.call_id.clone(), r.name.clone(), r.content.clone())
                } else {
                    ChatMessage::user(format!("Result of `{}`:\n{}", r.name, r.content))
                };
                msg.with_document_id(doc_id.clone())
            })
            .collect()
    }

    /// Append `input` to the history, ask the LLM, and record its reply.
    pub async fn llm_response(
        &mut self,
        input: Vec<ChatMessage>,
        ctx: &TaskContext,
    ) -> Result<LlmResponse, AgentError> {
        self.history[0] = self.system_turn();
        self.history.extend(input);

        let tools_api = self.uses_tools_api();
        let mut request = ChatRequest::new(self.history.clone());
        if tools_api {
            let tools = self.scope.usable_schemas();
            if !tools.is_empty() {
                request = request.with_tools(tools, self.config.tool_choice.clone());
            }
        }
        if let Some(max) = self.config.max_output_tokens.or(ctx.config.max_output_tokens) {
            request = request.with_max_tokens(max);
        }
        if let Some(sink) = &ctx.sink {
            request = request.with_sink(Arc::clone(sink));
        }
        // Per request: sibling tasks may share this client.
        request = request.with_stream(self.config.stream && ctx.streaming_allowed());

        tracing::debug!(
            agent = %self.config.name,
            model = %self.llm.model(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Requesting LLM response"
        );

        let response = self.llm.chat(request).await?;

        let response = if tools_api {
            self.history.push(response.to_message());
            response
        } else {
            self.history.push(ChatMessage::assistant(response.message.clone()));
            self.with_embedded_requests(response)
        };
        Ok(response)
    }

    /// Treat top-level `{"request": "<tool>", ...}` objects in the text as
    /// tool calls.
    fn with_embedded_requests(&mut self, mut response: LlmResponse) -> LlmResponse {
        for mut object in top_level_json_objects(&response.message) {
            let Some(Value::String(name)) = object.remove("request") else {
                continue;
            };
            if !self.scope.registry().has_tool(&name) {
                continue;
            }
            let id = format!("req_{}", self.next_request_id);
            self.next_request_id += 1;
            let arguments: Option<Map<String, Value>> = (!object.is_empty()).then_some(object);
            response
                .tool_calls
                .push(ToolCall::new(id, LlmFunctionCall { name, arguments }));
        }
        response
    }

    /// Execute one call within this agent's scope.
    ///
    /// Failures become error results for the LLM to read; they never abort.
    pub async fn handle_call(&self, call_id: &str, call: &LlmFunctionCall) -> ToolResult {
        let name = call.name.as_str();
        if !self.scope.can_handle(name) {
            tracing::warn!(agent = %self.config.name, tool = %name, "Call to a tool outside the agent's scope");
            return ToolResult::error(
                call_id,
                name,
                format!(
                    "Error: tool `{}` is not available. You may only use: {}",
                    name,
                    self.scope.handleable().join(", ")
                ),
            );
        }
        let Some(tool) = self.scope.tool(name) else {
            return ToolResult::error(call_id, name, format!("Error: unknown tool `{}`", name));
        };

        match tool.execute(call.arguments_value()).await {
            Ok(output) => {
                tracing::debug!(agent = %self.config.name, tool = %name, "Tool succeeded");
                ToolResult::ok(call_id, name, output)
            }
            Err(e) => {
                tracing::warn!(agent = %self.config.name, tool = %name, error = %e, "Tool failed");
                ToolResult::error(call_id, name, format!("Error: `{}` failed: {}", name, e))
            }
        }
    }

    /// Corrective result for a call whose arguments did not parse.
    pub fn malformed_result(&self, malformed: &MalformedCall) -> ToolResult {
        ToolResult::error(
            malformed.id.clone(),
            malformed.error.name.clone(),
            format!(
                "Error: could not parse the arguments of `{}`: {}. Call it again with a valid JSON object.",
                malformed.error.name, malformed.error.reason
            ),
        )
    }
}
