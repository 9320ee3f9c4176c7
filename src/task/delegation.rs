//! Sub-task delegation through the `task_tool` call.
//!
//! Each call spawns a fresh agent with its own model, prompt and tool
//! subset, runs it to completion one level deeper, and folds the child's
//! final document back into the parent as a tool result.

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::document::{ChatDocument, DocumentId, Origin, ToolResult};
use super::task::{Task, TaskConfig, TaskStatus};
use crate::agents::{AgentConfig, AgentError, ChatAgent, TaskContext};
use crate::llm::LlmFunctionCall;
use crate::tools::{ToolScope, ToolSelection, DONE_TOOL, TASK_TOOL};

const DEFAULT_MAX_ITERATIONS: usize = 10;
const DEFAULT_AGENT_NAME: &str = "SubAgent";

/// Arguments of a `task_tool` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskToolArgs {
    pub system_message: String,
    pub prompt: String,
    pub model: String,
    /// Missing means no tools beyond the done tool
    #[serde(default)]
    pub tools: ToolSelection,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub agent_name: Option<String>,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

/// Run every delegation call in `calls`; results come back in call order.
pub async fn run_all(
    parent: &ToolScope,
    parallel: bool,
    call_doc: DocumentId,
    calls: Vec<(String, LlmFunctionCall)>,
    ctx: &TaskContext,
) -> Vec<ToolResult> {
    if parallel && calls.len() > 1 {
        tracing::info!(count = calls.len(), depth = ctx.depth, "Running delegations concurrently");
        join_all(
            calls
                .iter()
                .map(|(id, call)| delegate(parent, call_doc, id, call, ctx)),
        )
        .await
    } else {
        let mut results = Vec::with_capacity(calls.len());
        for (id, call) in &calls {
            results.push(delegate(parent, call_doc, id, call, ctx).await);
        }
        results
    }
}

/// Run one delegation call as a child task.
///
/// Every failure becomes an error result; the parent never aborts here.
pub async fn delegate(
    parent: &ToolScope,
    call_doc: DocumentId,
    call_id: &str,
    call: &LlmFunctionCall,
    ctx: &TaskContext,
) -> ToolResult {
    let args: TaskToolArgs = match serde_json::from_value(call.arguments_value()) {
        Ok(args) => args,
        Err(e) => {
            return ToolResult::error(
                call_id,
                TASK_TOOL,
                format!("Error: invalid arguments for `{}`: {}", TASK_TOOL, e),
            )
        }
    };
    if !ctx.can_delegate() {
        tracing::warn!(depth = ctx.depth, max_depth = ctx.config.max_depth, "Delegation depth exceeded");
        return ToolResult::error(
            call_id,
            TASK_TOOL,
            format!(
                "Error: cannot delegate beyond depth {}. Solve the task yourself.",
                ctx.config.max_depth
            ),
        );
    }

    let mut child = match build_child(parent, &args, ctx) {
        Ok(task) => task,
        Err(e) => {
            tracing::warn!(model = %args.model, error = %e, "Could not build sub-task");
            return ToolResult::error(call_id, TASK_TOOL, format!("Error: could not start sub-task: {}", e));
        }
    };

    let name = child.name().to_string();
    tracing::info!(sub_task = %name, model = %args.model, depth = ctx.depth + 1, "Delegating");

    let prompt = ChatDocument::new(Origin::User, args.prompt.clone())
        .with_parent(call_doc)
        .with_sender(TASK_TOOL);
    let outcome = child.run(Some(prompt), &ctx.child_context()).await;

    match (outcome.status, outcome.result) {
        (TaskStatus::Completed { reason }, Some(result)) => {
            tracing::info!(sub_task = %name, reason = ?reason, turns = outcome.turns, "Sub-task finished");
            let copy = result.deep_copy();
            let copy_id = ctx.documents.register(&copy);
            ToolResult {
                document_id: Some(copy_id),
                ..ToolResult::ok(call_id, TASK_TOOL, copy.content)
            }
        }
        (TaskStatus::Completed { .. }, None) => {
            ToolResult::ok(call_id, TASK_TOOL, "")
        }
        (TaskStatus::Aborted { reason }, _) => {
            tracing::warn!(sub_task = %name, error = %reason, "Sub-task aborted");
            ToolResult::error(call_id, TASK_TOOL, format!("Sub-task `{}` failed: {}", name, reason))
        }
        (TaskStatus::Cancelled, _) => {
            ToolResult::error(call_id, TASK_TOOL, format!("Sub-task `{}` failed: cancelled", name))
        }
    }
}

/// Build the child task a delegation call asks for.
pub fn build_child(parent: &ToolScope, args: &TaskToolArgs, ctx: &TaskContext) -> Result<Task, AgentError> {
    let llm = ctx.clients.client_for(&args.model)?;
    let scope = parent.subset(&args.tools);
    let name = args
        .agent_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string());

    let config = AgentConfig::new(name.clone(), args.system_message.clone()).with_handle_llm_no_tool(
        format!("You forgot to use the TOOL `{}` to return your result.", DONE_TOOL),
    );
    let agent = ChatAgent::new(config, llm, scope);
    Ok(Task::new(
        agent,
        TaskConfig::new(name).interactive(false).with_turns(args.max_iterations),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::config::Config;
    use crate::llm::{MockFactory, MockLm, MockReply, UsageLedger};
    use crate::tools::testing::calculator_registry;

    fn parent_scope() -> ToolScope {
        let mut scope = ToolScope::new(calculator_registry());
        scope
            .enable(&[TASK_TOOL, "multiplier_tool", "nebrowski_tool"], true, true)
            .unwrap();
        scope
    }

    fn ctx(factory: MockFactory) -> TaskContext {
        TaskContext::with_clients(
            Config::new("mock", "mock"),
            Arc::new(UsageLedger::new()),
            Arc::new(factory),
        )
    }

    fn call(args: serde_json::Value) -> LlmFunctionCall {
        LlmFunctionCall::new(TASK_TOOL, args.as_object().unwrap().clone())
    }

    #[test]
    fn test_args_defaults() {
        let args: TaskToolArgs = serde_json::from_value(json!({
            "system_message": "s",
            "prompt": "p",
            "model": "m"
        }))
        .unwrap();
        assert_eq!(args.tools, ToolSelection::None);
        assert_eq!(args.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert!(args.agent_name.is_none());
    }

    #[test]
    fn test_child_scope_and_name() {
        let factory = MockFactory::new().with(MockLm::new("gpt-4o-mini"));
        let ctx = ctx(factory);
        let args: TaskToolArgs = serde_json::from_value(json!({
            "system_message": "s",
            "prompt": "p",
            "model": "gpt-4o-mini",
            "tools": "ALL",
            "max_iterations": 3,
            "agent_name": "Calc"
        }))
        .unwrap();

        let child = build_child(&parent_scope(), &args, &ctx).unwrap();
        assert_eq!(child.name(), "Calc");
        assert_eq!(child.config().turns, Some(3));
        assert!(!child.config().interactive);
        assert!(child.agent().scope().can_handle("multiplier_tool"));
        assert!(!child.agent().scope().can_handle(TASK_TOOL));
        assert!(child.agent().config().handle_llm_no_tool.is_some());
    }

    #[tokio::test]
    async fn test_depth_cap_fails_call() {
        let mut config = Config::new("mock", "mock");
        config.max_depth = 0;
        let ctx = TaskContext::with_clients(
            config,
            Arc::new(UsageLedger::new()),
            Arc::new(MockFactory::new().with(MockLm::new("m"))),
        );
        let result = delegate(
            &parent_scope(),
            DocumentId::new(),
            "call_1",
            &call(json!({"system_message": "s", "prompt": "p", "model": "m"})),
            &ctx,
        )
        .await;
        assert!(result.is_error);
        assert!(result.content.contains("depth"));
    }

    #[tokio::test]
    async fn test_bad_args_fail_call() {
        let result = delegate(
            &parent_scope(),
            DocumentId::new(),
            "call_1",
            &call(json!({"prompt": 3})),
            &ctx(MockFactory::new()),
        )
        .await;
        assert!(result.is_error);
        assert_eq!(result.call_id, "call_1");
    }

    #[tokio::test]
    async fn test_child_abort_is_failed_result() {
        let factory = MockFactory::new().with(MockLm::new("m").with_script([MockReply::Error(
            crate::llm::LlmError::client_error(400, "bad request".to_string()),
        )]));
        let result = delegate(
            &parent_scope(),
            DocumentId::new(),
            "call_1",
            &call(json!({"system_message": "s", "prompt": "p", "model": "m", "agent_name": "Worker"})),
            &ctx(factory),
        )
        .await;
        assert!(result.is_error);
        assert!(result.content.starts_with("Sub-task `Worker` failed"));
    }

    #[tokio::test]
    async fn test_forgetful_child_is_reminded() {
        let factory = MockFactory::new().with(MockLm::new("m").with_script([
            MockReply::text("It is 4"),
            MockReply::tool(DONE_TOOL, json!({"content": "4"})),
        ]));
        let child_llm = factory.get("m").unwrap();
        let ctx = ctx(factory);
        let call_doc = ChatDocument::new(Origin::Llm, "");
        ctx.documents.register(&call_doc);

        let result = delegate(
            &parent_scope(),
            call_doc.id,
            "call_1",
            &call(json!({"system_message": "s", "prompt": "2 + 2?", "model": "m"})),
            &ctx,
        )
        .await;
        assert_eq!(result.content, "4");
        let copy = result.document_id.unwrap();
        assert!(ctx.documents.descends_from(copy, call_doc.id));

        let reminder = child_llm.requests()[1].last().cloned().unwrap();
        assert!(reminder.content.contains(DONE_TOOL));
    }
}
