//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world. This crate
//! never implements one; it only defines how the per-turn agent finds and
//! invokes them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether this tool edits files in the workspace. Edit explanations are
    /// only emitted for these.
    fn mutates_files(&self) -> bool {
        false
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// suite id -> names of the tools it contributed
    suites: HashMap<String, Vec<String>>,
}

/// A registry of available tools, shared between concurrently running agents.
///
/// Tools can be registered one at a time or as a named suite, which can later
/// be unregistered as a unit.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.write().tools.insert(name, tool);
    }

    /// Register a suite of tools under `suite_id`. Re-registering a suite
    /// replaces its previous tools.
    pub fn register_suite(&self, suite_id: impl Into<String>, tools: Vec<Arc<dyn Tool>>) {
        let suite_id = suite_id.into();
        let mut inner = self.write();
        if let Some(previous) = inner.suites.remove(&suite_id) {
            for name in previous {
                inner.tools.remove(&name);
            }
        }
        let names: Vec<String> = tools.iter().map(|t| t.name().to_string()).collect();
        tracing::debug!(suite = %suite_id, tools = names.len(), "Registered tool suite");
        for tool in tools {
            inner.tools.insert(tool.name().to_string(), tool);
        }
        inner.suites.insert(suite_id, names);
    }

    /// Remove every tool contributed by `suite_id`. Returns how many were removed.
    pub fn unregister_suite(&self, suite_id: &str) -> usize {
        let mut inner = self.write();
        let Some(names) = inner.suites.remove(suite_id) else {
            return 0;
        };
        let removed = names
            .iter()
            .filter(|name| inner.tools.remove(name.as_str()).is_some())
            .count();
        tracing::debug!(suite = %suite_id, removed, "Unregistered tool suite");
        removed
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().tools.get(name).cloned()
    }

    /// Get all tool definitions (for sending to the LLM), sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.read().tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool call. The registry lock is not held while the tool runs.
    pub async fn execute(&self, call: &ToolCall) -> std::result::Result<ToolResult, ToolError> {
        let tool = self.get(&call.name).ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let mut result = tool.execute(call.arguments.clone()).await?;
        result.call_id = call.id.clone();
        Ok(result)
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<String> {
        self.read().tools.keys().cloned().collect()
    }
}
