//! Tool system for agents.
//!
//! Tools are registered once in a [`ToolRegistry`] and then enabled per agent
//! through a [`ToolScope`]: a tool may be enabled for *use* (the agent
//! advertises it to its model) and/or *handle* (the agent executes it when
//! it arrives). The done tool is usable and handleable in every scope.

pub mod orchestration;

pub use orchestration::{DoneTool, DoneToolArgs, TaskTool, DONE_TOOL, TASK_TOOL};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::llm::ToolDefinition;

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// Registry of available tools.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a registry holding the built-in orchestration tools.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(DoneTool));
        registry.register(Arc::new(TaskTool));
        registry
    }

    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        tracing::debug!(tool = %tool.name(), "Registering tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// List all available tools.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Schema for one tool in LLM-compatible format.
    pub fn schema(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.get(name).map(|t| {
            ToolDefinition::function(t.name(), t.description(), t.parameters_schema())
        })
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;

        tool.execute(args).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Tool subset requested for a delegated agent: every tool, none, or a list.
///
/// Deserializes from `"ALL"`, `"NONE"`, `["ALL"]`, `["NONE"]` or a list of names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolSelection {
    All,
    #[default]
    None,
    Named(Vec<String>),
}

impl ToolSelection {
    fn from_names(names: Vec<String>) -> Self {
        match names.as_slice() {
            [only] if only.eq_ignore_ascii_case("all") => ToolSelection::All,
            [only] if only.eq_ignore_ascii_case("none") => ToolSelection::None,
            [] => ToolSelection::None,
            _ => ToolSelection::Named(names),
        }
    }
}

impl<'de> Deserialize<'de> for ToolSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
            Nothing(()),
        }

        match Raw::deserialize(deserializer) {
            Ok(Raw::One(name)) => Ok(Self::from_names(vec![name])),
            Ok(Raw::Many(names)) => Ok(Self::from_names(names)),
            Ok(Raw::Nothing(())) => Ok(ToolSelection::None),
            Err(_) => Err(de::Error::custom(
                "expected \"ALL\", \"NONE\" or a list of tool names",
            )),
        }
    }
}

impl Serialize for ToolSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolSelection::All => serializer.serialize_str("ALL"),
            ToolSelection::None => serializer.serialize_str("NONE"),
            ToolSelection::Named(names) => names.serialize(serializer),
        }
    }
}

/// Which registered tools one agent instance may use and handle.
#[derive(Clone)]
pub struct ToolScope {
    registry: ToolRegistry,
    usable: BTreeSet<String>,
    handleable: BTreeSet<String>,
}

impl ToolScope {
    /// A scope over `registry` with nothing enabled but the done tool.
    pub fn new(registry: ToolRegistry) -> Self {
        let mut registry = registry;
        if !registry.has_tool(DONE_TOOL) {
            registry.register(Arc::new(DoneTool));
        }
        Self {
            registry,
            usable: BTreeSet::new(),
            handleable: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Enable tools for use and/or handling.
    ///
    /// # Errors
    ///
    /// Returns `ScopeError::UnknownTool` for a name missing from the
    /// registry; nothing is enabled in that case.
    pub fn enable(&mut self, names: &[&str], use_tool: bool, handle: bool) -> Result<(), ScopeError> {
        if let Some(missing) = names.iter().find(|n| !self.registry.has_tool(n)) {
            return Err(ScopeError::UnknownTool(missing.to_string()));
        }
        for name in names {
            if use_tool {
                self.usable.insert(name.to_string());
            }
            if handle {
                self.handleable.insert(name.to_string());
            }
        }
        Ok(())
    }

    /// Enable every registered tool for both use and handling.
    pub fn enable_all(&mut self) {
        let names: Vec<String> = self.registry.names().map(str::to_string).collect();
        self.usable.extend(names.iter().cloned());
        self.handleable.extend(names);
    }

    pub fn disable(&mut self, name: &str) {
        self.usable.remove(name);
        self.handleable.remove(name);
    }

    pub fn can_use(&self, name: &str) -> bool {
        name == DONE_TOOL || self.usable.contains(name)
    }

    pub fn can_handle(&self, name: &str) -> bool {
        name == DONE_TOOL || self.handleable.contains(name)
    }

    /// Names this scope will execute, done tool included, sorted.
    pub fn handleable(&self) -> Vec<String> {
        let mut names = self.handleable.clone();
        names.insert(DONE_TOOL.to_string());
        names.into_iter().collect()
    }

    /// Schemas of every usable tool, sorted by name.
    pub fn usable_schemas(&self) -> Vec<ToolDefinition> {
        let mut names = self.usable.clone();
        names.insert(DONE_TOOL.to_string());
        names
            .iter()
            .filter_map(|name| self.registry.schema(name))
            .collect()
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    /// Scope for a delegated agent, drawn from the tools this scope handles.
    ///
    /// `All` grants every handleable tool except the delegation tool itself,
    /// which must be named explicitly. Named tools this scope cannot handle
    /// are skipped.
    pub fn subset(&self, selection: &ToolSelection) -> ToolScope {
        let mut child = ToolScope::new(self.registry.clone());
        let granted: Vec<String> = match selection {
            ToolSelection::None => Vec::new(),
            ToolSelection::All => self
                .handleable
                .iter()
                .filter(|name| name.as_str() != TASK_TOOL)
                .cloned()
                .collect(),
            ToolSelection::Named(names) => names
                .iter()
                .filter(|name| {
                    let ok = self.can_handle(name);
                    if !ok {
                        tracing::warn!(tool = %name, "Requested tool is not available to the delegating agent");
                    }
                    ok
                })
                .cloned()
                .collect(),
        };
        child.usable.extend(granted.iter().cloned());
        child.handleable.extend(granted);
        child
    }
}

impl fmt::Debug for ToolScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolScope")
            .field("usable", &self.usable)
            .field("handleable", &self.handleable)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use serde_json::json;

    /// a * b
    pub struct MultiplierTool;

    #[async_trait]
    impl Tool for MultiplierTool {
        fn name(&self) -> &str {
            "multiplier_tool"
        }

        fn description(&self) -> &str {
            "To calculate the product of two numbers."
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            })
        }

        async fn execute(&self, args: Value) -> anyhow::Result<String> {
            let a = args["a"].as_i64().ok_or_else(|| anyhow::anyhow!("a must be an integer"))?;
            let b = args["b"].as_i64().ok_or_else(|| anyhow::anyhow!("b must be an integer"))?;
            Ok((a * b).to_string())
        }
    }

    /// 3a + b
    pub struct NebrowskiTool;

    #[async_trait]
    impl Tool for NebrowskiTool {
        fn name(&self) -> &str {
            "nebrowski_tool"
        }

        fn description(&self) -> &str {
            "To compute the Nebrowski operation of two numbers: neb(a,b) = 3a + b"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            })
        }

        async fn execute(&self, args: Value) -> anyhow::Result<String> {
            let a = args["a"].as_i64().ok_or_else(|| anyhow::anyhow!("a must be an integer"))?;
            let b = args["b"].as_i64().ok_or_else(|| anyhow::anyhow!("b must be an integer"))?;
            Ok(format!("Nebrowski({}, {}) = {}", a, b, 3 * a + b))
        }
    }

    pub fn calculator_registry() -> ToolRegistry {
        ToolRegistry::new()
            .with_tool(Arc::new(MultiplierTool))
            .with_tool(Arc::new(NebrowskiTool))
    }
}
