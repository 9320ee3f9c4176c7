//! Documents: the turns a task produces, with provenance.
//!
//! Documents never own their parents. A document carries its parent's id,
//! and the [`DocumentStore`] resolves ids, so copies stay cheap and the
//! chain stays walkable after a document crosses a task boundary.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::{LlmFunctionCall, LlmResponse, MalformedCall, ToolCall, UsageCounter};

/// Longest parent chain [`DocumentStore::ancestors`] will follow.
pub const MAX_PROVENANCE_HOPS: usize = 10_000;

/// Unique identifier for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Llm,
    /// Tool results, corrective replies and error turns
    Agent,
    User,
    SubTask,
}

/// Outcome of one handled call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Call id; empty for a legacy function call
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
    /// Copy of a sub-task's result document, for delegation calls
    pub document_id: Option<DocumentId>,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error: false,
            document_id: None,
        }
    }

    pub fn error(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::ok(call_id, name, content)
        }
    }
}

/// One turn produced during a task run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatDocument {
    pub id: DocumentId,
    /// The document that caused this one
    pub parent_id: Option<DocumentId>,
    pub content: String,
    pub reasoning: String,
    pub origin: Origin,
    /// Name of the agent or task that produced it
    pub sender_name: String,
    pub function_call: Option<LlmFunctionCall>,
    pub tool_calls: Vec<ToolCall>,
    pub malformed_calls: Vec<MalformedCall>,
    /// Resolved addressee; empty when unaddressed
    pub recipient: String,
    pub tool_results: Vec<ToolResult>,
    pub usage: Option<UsageCounter>,
}

impl ChatDocument {
    pub fn new(origin: Origin, content: impl Into<String>) -> Self {
        Self {
            id: DocumentId::new(),
            parent_id: None,
            content: content.into(),
            reasoning: String::new(),
            origin,
            sender_name: String::new(),
            function_call: None,
            tool_calls: Vec::new(),
            malformed_calls: Vec::new(),
            recipient: String::new(),
            tool_results: Vec::new(),
            usage: None,
        }
    }

    /// Wrap an LLM reply, resolving its recipient.
    ///
    /// For text addressing (`TO: name ...`) the content is the part meant
    /// for the recipient.
    pub fn from_llm(response: &LlmResponse) -> Self {
        let (recipient, message) = response.recipient_and_message();
        let content = if response.has_calls() {
            response.message.clone()
        } else {
            message
        };
        Self {
            reasoning: response.reasoning.clone(),
            function_call: response.function_call.clone(),
            tool_calls: response.tool_calls.clone(),
            malformed_calls: response.malformed_calls.clone(),
            recipient,
            usage: response.usage.clone(),
            ..Self::new(Origin::Llm, content)
        }
    }

    pub fn with_parent(mut self, parent: DocumentId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_sender(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    pub fn with_tool_results(mut self, results: Vec<ToolResult>) -> Self {
        self.tool_results = results;
        self
    }

    /// Whether the document asks for any call, well-formed or not.
    pub fn has_calls(&self) -> bool {
        self.function_call.is_some() || !self.tool_calls.is_empty() || !self.malformed_calls.is_empty()
    }

    /// Copy with a fresh id and the same parent.
    pub fn deep_copy(&self) -> Self {
        Self {
            id: DocumentId::new(),
            ..self.clone()
        }
    }
}

/// Index of documents by id; grows until [`clear`](Self::clear)ed.
#[derive(Debug, Default)]
pub struct DocumentStore {
    docs: RwLock<HashMap<DocumentId, ChatDocument>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a copy of `doc`; returns its id.
    pub fn register(&self, doc: &ChatDocument) -> DocumentId {
        self.docs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(doc.id, doc.clone());
        doc.id
    }

    pub fn get(&self, id: DocumentId) -> Option<ChatDocument> {
        self.docs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn parent_of(&self, id: DocumentId) -> Option<DocumentId> {
        self.docs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .and_then(|d| d.parent_id)
    }

    /// Parent ids from `id` upward, nearest first.
    ///
    /// Stops at a document without a parent, an unregistered id, a
    /// repeated id, or after [`MAX_PROVENANCE_HOPS`].
    pub fn ancestors(&self, id: DocumentId) -> Vec<DocumentId> {
        let docs = self.docs.read().unwrap_or_else(|p| p.into_inner());
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = docs.get(&id).and_then(|d| d.parent_id);

        while let Some(parent) = current {
            if chain.len() >= MAX_PROVENANCE_HOPS || !seen.insert(parent) {
                tracing::warn!(document = %id, "Provenance walk cut short");
                break;
            }
            chain.push(parent);
            current = docs.get(&parent).and_then(|d| d.parent_id);
        }
        chain
    }

    /// Whether `ancestor` is reachable from `id` through parent links.
    pub fn descends_from(&self, id: DocumentId, ancestor: DocumentId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    /// Drop every document, e.g. between root tasks of a long-lived process.
    ///
    /// Ids held elsewhere stop resolving; provenance walks from them end
    /// immediately.
    pub fn clear(&self) {
        self.docs.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
