//! The task engine: drives turns among the LLM, the agent (tool executor),
//! the user and named sub-tasks until a completion rule fires.
//!
//! # State Machine
//! ```text
//! Running -> Completed { DoneTool | DoneSequence | TurnLimit | FinalAnswer }
//!        \-> Aborted   (invocation failed after retries)
//!        \-> Cancelled (external cancellation)
//! ```

use std::collections::HashMap;

use async_recursion::async_recursion;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::delegation;
use super::document::{ChatDocument, Origin, ToolResult};
use super::done::{first_match, DoneSequence, EventKind};
use crate::agents::{ChatAgent, RunMode, TaskContext};
use crate::llm::LlmFunctionCall;
use crate::tools::{DoneToolArgs, DONE_TOOL, TASK_TOOL};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a task completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionReason {
    /// The agent handled the done tool
    DoneTool,
    /// A configured done sequence matched (in `T,A` notation)
    DoneSequence(String),
    /// The turn ceiling was reached
    TurnLimit,
    /// A non-interactive LLM answered in plain text with nothing left to do
    FinalAnswer,
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Completed { reason: CompletionReason },
    /// Unrecoverable invocation error
    Aborted { reason: String },
    /// Abandoned on external cancellation; never reported as completed
    Cancelled,
}

impl TaskStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed { .. })
    }
}

/// Result of [`Task::run`].
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// Last document; `None` unless completed
    pub result: Option<ChatDocument>,
    /// Turns taken
    pub turns: usize,
    pub events: Vec<EventKind>,
}

impl TaskOutcome {
    /// Result text, empty when there is none.
    pub fn content(&self) -> &str {
        self.result.as_ref().map_or("", |d| d.content.as_str())
    }
}

/// Run policy for one task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub name: String,
    /// Hand plain LLM answers to the user
    pub interactive: bool,
    /// Turn ceiling; `None` for unbounded
    pub turns: Option<usize>,
    pub done_sequences: Vec<DoneSequence>,
    /// Run several delegation calls of one turn concurrently
    pub parallel_delegation: bool,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interactive: false,
            turns: None,
            done_sequences: Vec::new(),
            parallel_delegation: true,
        }
    }

    /// Parse done sequences such as `"T,A"`.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidDoneSequence` for an unknown code.
    pub fn with_done_sequences(mut self, sequences: &[&str]) -> Result<Self, TaskError> {
        self.done_sequences = sequences
            .iter()
            .map(|s| s.parse())
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn with_turns(mut self, turns: usize) -> Self {
        self.turns = Some(turns);
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_parallel_delegation(mut self, parallel: bool) -> Self {
        self.parallel_delegation = parallel;
        self
    }
}

/// Errors that can occur while configuring a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid done sequence: {0:?}")]
    InvalidDoneSequence(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Actor {
    Llm,
    Agent,
    User,
    SubTask(String),
    /// Nobody is left to respond
    Finish,
}

enum Step {
    Next(ChatDocument, EventKind),
    Done(CompletionReason, ChatDocument, EventKind),
    Abort(String),
}

/// An agent plus the loop that drives it.
///
/// # Invariants
/// - Turns are recorded strictly in the order they are produced
/// - Every recorded document is registered in the context's store before
///   the next turn starts
pub struct Task {
    id: TaskId,
    config: TaskConfig,
    agent: ChatAgent,
    sub_tasks: HashMap<String, Task>,
    pending: Option<ChatDocument>,
    events: Vec<EventKind>,
    turns: usize,
}

impl Task {
    pub fn new(agent: ChatAgent, config: TaskConfig) -> Self {
        Self {
            id: TaskId::new(),
            config,
            agent,
            sub_tasks: HashMap::new(),
            pending: None,
            events: Vec::new(),
            turns: 0,
        }
    }

    /// Register a sub-task the LLM can address by name (`TO[name]: ...`).
    pub fn add_sub_task(&mut self, task: Task) {
        self.sub_tasks.insert(task.name().to_string(), task);
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn agent(&self) -> &ChatAgent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut ChatAgent {
        &mut self.agent
    }

    /// Run with a plain-text user prompt.
    pub async fn run_prompt(&mut self, prompt: impl Into<String>, ctx: &TaskContext) -> TaskOutcome {
        let doc = ChatDocument::new(Origin::User, prompt).with_sender("User");
        self.run(Some(doc), ctx).await
    }

    /// Synchronous [`run`](Self::run) on a private current-thread runtime.
    ///
    /// Must not be called from inside a Tokio runtime.
    pub fn run_blocking(&mut self, prompt: Option<ChatDocument>, ctx: &TaskContext) -> TaskOutcome {
        let ctx = ctx.clone().with_mode(RunMode::Blocking);
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(self.run(prompt, &ctx)),
            Err(e) => TaskOutcome {
                status: TaskStatus::Aborted {
                    reason: format!("Failed to build runtime: {}", e),
                },
                result: None,
                turns: 0,
                events: Vec::new(),
            },
        }
    }

    /// Drive the loop until a completion rule fires, the invocation layer
    /// fails, or `ctx` is cancelled.
    ///
    /// The prompt, if any, becomes the pending document; it is not a turn.
    #[async_recursion]
    pub async fn run(&mut self, prompt: Option<ChatDocument>, ctx: &TaskContext) -> TaskOutcome {
        self.events.clear();
        self.turns = 0;
        self.pending = None;
        if let Some(doc) = prompt {
            ctx.documents.register(&doc);
            let messages = self.agent.messages_for(&doc);
            self.agent.extend_history(messages);
            self.pending = Some(doc);
        }

        tracing::info!(task = %self.config.name, depth = ctx.depth, "Task started");

        loop {
            if ctx.is_cancelled() {
                return self.cancelled();
            }
            if let Some(limit) = self.config.turns {
                if self.turns >= limit {
                    tracing::info!(task = %self.config.name, turns = self.turns, "Turn limit reached");
                    return self.completed(CompletionReason::TurnLimit);
                }
            }

            let actor = self.next_actor(ctx);
            tracing::debug!(task = %self.config.name, turn = self.turns + 1, actor = ?actor, "Next actor");
            if actor == Actor::Finish {
                return self.completed(CompletionReason::FinalAnswer);
            }

            let step = tokio::select! {
                biased;
                _ = ctx.cancel_token.cancelled() => None,
                step = self.step(actor, ctx) => Some(step),
            };

            match step {
                None => return self.cancelled(),
                Some(Step::Abort(reason)) => {
                    tracing::error!(task = %self.config.name, error = %reason, "Task aborted");
                    return TaskOutcome {
                        status: TaskStatus::Aborted { reason },
                        result: None,
                        turns: self.turns,
                        events: self.events.clone(),
                    };
                }
                Some(Step::Done(reason, doc, kind)) => {
                    self.record(doc, kind, ctx);
                    return self.completed(reason);
                }
                Some(Step::Next(doc, kind)) => {
                    self.record(doc, kind, ctx);
                    if let Some(seq) = first_match(&self.config.done_sequences, &self.events) {
                        return self.completed(CompletionReason::DoneSequence(seq.to_string()));
                    }
                }
            }
        }
    }

    fn can_ask_user(&self, ctx: &TaskContext) -> bool {
        self.config.interactive && ctx.user_input.is_some()
    }

    fn next_actor(&self, ctx: &TaskContext) -> Actor {
        let Some(doc) = &self.pending else {
            return Actor::Llm;
        };
        if doc.has_calls() {
            return Actor::Agent;
        }
        if doc.origin != Origin::Llm {
            return Actor::Llm;
        }

        if !doc.recipient.is_empty() {
            if self.sub_tasks.contains_key(&doc.recipient) {
                return Actor::SubTask(doc.recipient.clone());
            }
            if doc.recipient.eq_ignore_ascii_case("user") && self.can_ask_user(ctx) {
                return Actor::User;
            }
        }
        if self.agent.config().handle_llm_no_tool.is_some() {
            return Actor::Agent;
        }
        if self.can_ask_user(ctx) {
            return Actor::User;
        }
        if !self.config.done_sequences.is_empty() {
            return Actor::Llm;
        }
        Actor::Finish
    }

    async fn step(&mut self, actor: Actor, ctx: &TaskContext) -> Step {
        let parent = self.pending.as_ref().map(|d| d.id);
        let with_parent = |doc: ChatDocument| match parent {
            Some(id) => doc.with_parent(id),
            None => doc,
        };

        match actor {
            Actor::Llm => match self.agent.llm_response(Vec::new(), ctx).await {
                Ok(response) => {
                    let doc = with_parent(ChatDocument::from_llm(&response).with_sender(self.agent.name()));
                    let kind = if doc.has_calls() {
                        EventKind::ToolCall
                    } else {
                        EventKind::Llm
                    };
                    Step::Next(doc, kind)
                }
                Err(e) => Step::Abort(e.to_string()),
            },
            Actor::Agent => {
                let Some(doc) = self.pending.clone() else {
                    return Step::Abort("agent has nothing to respond to".to_string());
                };
                if doc.has_calls() {
                    return self.handle_calls(&doc, ctx).await;
                }
                let reply = self.agent.config().handle_llm_no_tool.clone().unwrap_or_default();
                let doc = with_parent(ChatDocument::new(Origin::Agent, reply).with_sender(self.agent.name()));
                Step::Next(doc, EventKind::AgentHandled)
            }
            Actor::User => {
                let Some(input) = ctx.user_input.as_ref() else {
                    return Step::Abort("no user input source".to_string());
                };
                let prompt = self.pending.as_ref().map_or("", |d| d.content.as_str());
                match input.read(prompt).await {
                    Ok(text) => {
                        let doc = with_parent(ChatDocument::new(Origin::User, text).with_sender("User"));
                        Step::Next(doc, EventKind::User)
                    }
                    Err(e) => Step::Abort(format!("User input failed: {}", e)),
                }
            }
            Actor::SubTask(name) => {
                let content = self.pending.as_ref().map(|d| d.content.clone()).unwrap_or_default();
                let Some(sub) = self.sub_tasks.get_mut(&name) else {
                    return Step::Abort(format!("unknown sub-task {}", name));
                };
                let prompt = with_parent(ChatDocument::new(Origin::User, content).with_sender(self.config.name.clone()));
                let outcome = sub.run(Some(prompt), &ctx.child_context()).await;
                let doc = match (&outcome.status, &outcome.result) {
                    (TaskStatus::Completed { .. }, Some(result)) => {
                        let mut copy = result.deep_copy();
                        copy.origin = Origin::SubTask;
                        copy.sender_name = name.clone();
                        copy.tool_calls.clear();
                        copy.function_call = None;
                        copy.malformed_calls.clear();
                        copy.tool_results.clear();
                        copy.recipient.clear();
                        copy
                    }
                    (status, _) => with_parent(ChatDocument::new(
                        Origin::SubTask,
                        format!("Sub-task {} did not complete: {:?}", name, status),
                    )),
                };
                Step::Next(doc, EventKind::SubTask)
            }
            Actor::Finish => Step::Abort("nothing to run".to_string()),
        }
    }

    /// Handle every call in `doc`; results come back in call order.
    async fn handle_calls(&mut self, doc: &ChatDocument, ctx: &TaskContext) -> Step {
        let mut calls: Vec<(String, LlmFunctionCall)> = Vec::new();
        if let Some(call) = &doc.function_call {
            calls.push((String::new(), call.clone()));
        }
        calls.extend(doc.tool_calls.iter().map(|tc| (tc.id.clone(), tc.function.clone())));

        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut delegations = Vec::new();
        let mut done_payload = None;

        for (i, (id, call)) in calls.iter().enumerate() {
            if call.name == DONE_TOOL {
                let payload = DoneToolArgs::from_value(&call.arguments_value())
                    .content
                    .unwrap_or_else(|| doc.content.clone());
                done_payload.get_or_insert_with(|| payload.clone());
                results[i] = Some(ToolResult::ok(id.clone(), DONE_TOOL, payload));
            } else if call.name == TASK_TOOL && self.agent.scope().can_handle(TASK_TOOL) {
                delegations.push(i);
            } else {
                results[i] = Some(self.agent.handle_call(id, call).await);
            }
        }

        if !delegations.is_empty() && done_payload.is_none() {
            let requested: Vec<(String, LlmFunctionCall)> =
                delegations.iter().map(|&i| calls[i].clone()).collect();
            let delegated = delegation::run_all(
                self.agent.scope(),
                self.config.parallel_delegation,
                doc.id,
                requested,
                ctx,
            )
            .await;
            for (i, result) in delegations.iter().zip(delegated) {
                results[*i] = Some(result);
            }
        } else {
            for &i in &delegations {
                results[i] = Some(ToolResult::error(
                    calls[i].0.clone(),
                    TASK_TOOL,
                    "Not run: the task finished in the same turn.",
                ));
            }
        }

        let mut results: Vec<ToolResult> = results.into_iter().flatten().collect();
        results.extend(doc.malformed_calls.iter().map(|m| {
            tracing::warn!(task = %self.config.name, tool = %m.error.name, "Malformed call");
            self.agent.malformed_result(m)
        }));

        let content = match (&done_payload, results.as_slice()) {
            (Some(payload), _) => payload.clone(),
            (None, [only]) => only.content.clone(),
            (None, many) => many
                .iter()
                .map(|r| format!("`{}`: {}", r.name, r.content))
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        let reply = ChatDocument::new(Origin::Agent, content)
            .with_parent(doc.id)
            .with_sender(self.agent.name())
            .with_tool_results(results);

        match done_payload {
            Some(_) => Step::Done(CompletionReason::DoneTool, reply, EventKind::AgentHandled),
            None => Step::Next(reply, EventKind::AgentHandled),
        }
    }

    fn record(&mut self, doc: ChatDocument, kind: EventKind, ctx: &TaskContext) {
        ctx.documents.register(&doc);
        if doc.origin != Origin::Llm {
            let messages = self.agent.messages_for(&doc);
            self.agent.extend_history(messages);
        }
        self.turns += 1;
        self.events.push(kind);
        tracing::debug!(
            task = %self.config.name,
            turn = self.turns,
            event = %kind,
            origin = ?doc.origin,
            "Turn recorded"
        );
        self.pending = Some(doc);
    }

    fn completed(&self, reason: CompletionReason) -> TaskOutcome {
        tracing::info!(task = %self.config.name, turns = self.turns, reason = ?reason, "Task completed");
        TaskOutcome {
            status: TaskStatus::Completed { reason },
            result: self.pending.clone(),
            turns: self.turns,
            events: self.events.clone(),
        }
    }

    fn cancelled(&self) -> TaskOutcome {
        tracing::info!(task = %self.config.name, turns = self.turns, "Task cancelled");
        TaskOutcome {
            status: TaskStatus::Cancelled,
            result: None,
            turns: self.turns,
            events: self.events.clone(),
        }
    }
}
