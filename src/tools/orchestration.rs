//! Orchestration tools: ending a task and delegating to a sub-task.
//!
//! Both are intercepted by the task engine; their `execute` bodies only
//! matter when a registry is driven directly.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::Tool;

pub const DONE_TOOL: &str = "done_tool";
pub const TASK_TOOL: &str = "task_tool";

/// Arguments of the done tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DoneToolArgs {
    #[serde(default)]
    pub content: Option<String>,
}

impl DoneToolArgs {
    /// Lenient decode; anything unparseable counts as "no payload".
    pub fn from_value(args: &Value) -> Self {
        match args.get("content") {
            Some(Value::String(s)) => Self {
                content: Some(s.clone()),
            },
            Some(Value::Null) | None => Self::default(),
            Some(other) => Self {
                content: Some(other.to_string()),
            },
        }
    }
}

/// Ends the current task with an explicit result.
pub struct DoneTool;

#[async_trait]
impl Tool for DoneTool {
    fn name(&self) -> &str {
        DONE_TOOL
    }

    fn description(&self) -> &str {
        "Signal that the current task is finished, passing the final result in `content`."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The final result of the task"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        Ok(DoneToolArgs::from_value(&args).content.unwrap_or_default())
    }
}

/// Spawns a sub-agent with its own model, prompt and tools.
pub struct TaskTool;

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        TASK_TOOL
    }

    fn description(&self) -> &str {
        r#"Delegate a self-contained sub-problem to a new sub-agent. The sub-agent runs
with its own system message, model and tools, and returns its final result
(via `done_tool`) as the result of this call."#
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "system_message": {
                    "type": "string",
                    "description": "Instructions for the sub-agent"
                },
                "prompt": {
                    "type": "string",
                    "description": "The specific task for the sub-agent"
                },
                "model": {
                    "type": "string",
                    "description": "Model id the sub-agent should use"
                },
                "tools": {
                    "description": "Tool names the sub-agent may use, or \"ALL\" / \"NONE\"",
                    "anyOf": [
                        {"type": "string", "enum": ["ALL", "NONE"]},
                        {"type": "array", "items": {"type": "string"}}
                    ]
                },
                "max_iterations": {
                    "type": "integer",
                    "description": "Turn ceiling for the sub-agent"
                },
                "agent_name": {
                    "type": "string",
                    "description": "Optional name for the sub-agent"
                }
            },
            "required": ["system_message", "prompt", "model", "tools", "max_iterations"]
        })
    }

    async fn execute(&self, _args: Value) -> anyhow::Result<String> {
        anyhow::bail!("{} can only be handled inside a running task", TASK_TOOL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_args_lenient() {
        assert_eq!(
            DoneToolArgs::from_value(&json!({"content": "35"})).content.as_deref(),
            Some("35")
        );
        assert_eq!(
            DoneToolArgs::from_value(&json!({"content": 35})).content.as_deref(),
            Some("35")
        );
        assert!(DoneToolArgs::from_value(&json!({})).content.is_none());
    }

    #[test]
    fn test_task_tool_needs_engine() {
        assert!(tokio_test::block_on(TaskTool.execute(json!({}))).is_err());
        assert_eq!(
            tokio_test::block_on(DoneTool.execute(json!({"content": "ok"}))).unwrap(),
            "ok"
        );
    }
}
