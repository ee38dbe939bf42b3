//! Tool registry and executor system

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agents::AgentProfile;
use crate::provider::ToolDefinition;

pub mod mail;

/// Trait for executing tools
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, input: Value) -> Result<String>;
    fn list_tools(&self) -> Vec<ToolDefinition>;
}

/// Individual tool handler
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value) -> Result<String>;
}

fn definition(handler: &dyn ToolHandler) -> ToolDefinition {
    ToolDefinition {
        name: handler.name().to_string(),
        description: handler.description().to_string(),
        input_schema: handler.input_schema(),
    }
}

/// Registry of available tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        debug!("Registering tool: {}", name);
        self.tools.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, tool_name: &str, input: Value) -> Result<String> {
        debug!("Executing tool: {} with input: {:?}", tool_name, input);

        let handler = self
            .tools
            .get(tool_name)
            .ok_or_else(|| anyhow!("Unknown tool: {}", tool_name))?;

        match handler.execute(input).await {
            Ok(result) => {
                debug!("Tool {} succeeded", tool_name);
                Ok(result)
            }
            Err(e) => {
                warn!("Tool {} failed: {}", tool_name, e);
                Err(e)
            }
        }
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|handler| definition(handler.as_ref()))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

/// The tool surface one agent sees: its own built-in tools (mail) plus the
/// shared executor, filtered through the agent profile's allow/deny lists.
pub struct AgentToolExecutor {
    agent_id: String,
    builtin: ToolRegistry,
    shared: Option<Arc<dyn ToolExecutor>>,
    profile: AgentProfile,
}

impl AgentToolExecutor {
    pub fn new(
        profile: AgentProfile,
        builtin: ToolRegistry,
        shared: Option<Arc<dyn ToolExecutor>>,
    ) -> Self {
        Self {
            agent_id: profile.id.clone(),
            builtin,
            shared,
            profile,
        }
    }
}

#[async_trait]
impl ToolExecutor for AgentToolExecutor {
    async fn execute(&self, tool_name: &str, input: Value) -> Result<String> {
        if !self.profile.is_tool_allowed(tool_name) {
            warn!("Agent {} attempted to use non-allowed tool: {}", self.agent_id, tool_name);
            return Err(anyhow!("Tool '{}' is not available for agent '{}'", tool_name, self.agent_id));
        }
        if self.builtin.contains(tool_name) {
            return self.builtin.execute(tool_name, input).await;
        }
        match &self.shared {
            Some(shared) => {
                debug!("Agent {} executing shared tool: {}", self.agent_id, tool_name);
                shared.execute(tool_name, input).await
            }
            None => Err(anyhow!("Unknown tool: {}", tool_name)),
        }
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools = self.builtin.list_tools();
        if let Some(shared) = &self.shared {
            tools.extend(
                shared
                    .list_tools()
                    .into_iter()
                    .filter(|t| !self.builtin.contains(&t.name)),
            );
        }
        tools.retain(|t| self.profile.is_tool_allowed(&t.name));
        tools
    }
}

/// Helper function to create a JSON schema for tool input
pub fn json_schema(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Truncate oversized tool output on a char boundary
pub fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str("\n[Output truncated]");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyTool;

    #[async_trait]
    impl ToolHandler for DummyTool {
        fn name(&self) -> &str {
            "dummy"
        }

        fn description(&self) -> &str {
            "A dummy tool for testing"
        }

        fn input_schema(&self) -> Value {
            json_schema(
                serde_json::json!({
                    "message": {
                        "type": "string",
                        "description": "Test message"
                    }
                }),
                vec!["message"],
            )
        }

        async fn execute(&self, _input: Value) -> Result<String> {
            Ok("dummy result".to_string())
        }
    }

    struct EchoTool(&'static str);

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn input_schema(&self) -> Value {
            json_schema(serde_json::json!({}), vec![])
        }

        async fn execute(&self, input: Value) -> Result<String> {
            Ok(format!("{}:{}", self.0, input))
        }
    }

    fn shared_registry() -> Arc<dyn ToolExecutor> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool("search")));
        registry.register(Arc::new(EchoTool("run_command")));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_tool_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool));

        assert_eq!(registry.len(), 1);

        let result = registry.execute("dummy", serde_json::json!({"message": "test"})).await;
        assert_eq!(result.unwrap(), "dummy result");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nonexistent", serde_json::json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_agent_executor_merges_and_filters() {
        let mut builtin = ToolRegistry::new();
        builtin.register(Arc::new(DummyTool));
        let mut profile = AgentProfile::new("coder", "Coder");
        profile.denied_tools = vec!["run_command".to_string()];

        let executor = AgentToolExecutor::new(profile, builtin, Some(shared_registry()));
        let names: Vec<String> = executor.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["dummy", "search"]);

        assert_eq!(executor.execute("dummy", Value::Null).await.unwrap(), "dummy result");
        assert!(executor.execute("search", Value::Null).await.unwrap().starts_with("search:"));
        assert!(executor.execute("run_command", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_agent_executor_without_shared() {
        let executor = AgentToolExecutor::new(AgentProfile::new("a", "A"), ToolRegistry::new(), None);
        assert!(executor.list_tools().is_empty());
        assert!(executor.execute("search", Value::Null).await.is_err());
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short".to_string(), 10), "short");
        let long = "é".repeat(10);
        let cut = truncate_output(long, 5);
        assert_eq!(cut, "éé\n[Output truncated]");
    }
}
