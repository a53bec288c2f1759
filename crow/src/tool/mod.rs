//! Tool registry: built-in tools plus tools discovered from MCP servers.
//!
//! The registry maps tool names to callers and knows which tools are
//! *special*: executing one of those (currently only `terminate`) moves the
//! agent to its finished state.

pub mod builtin;
pub mod mcp;

pub use mcp::{McpServerSpec, McpServersConfig, McpTransportKind};

use crate::error::{McpResult, ToolError, ToolResult};
use crate::schema::{Tool, ToolCall, ToolChoice};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Name of the built-in terminate tool.
pub const TERMINATE_TOOL: &str = "terminate";

/// A callable tool.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    /// Registered tool name.
    fn name(&self) -> &str;

    /// Descriptor advertised to the model.
    fn definition(&self) -> Tool;

    /// Execute with already-parsed arguments.
    async fn call(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> ToolResult<String>;
}

/// What the agent should do after a tool executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFlow {
    /// Keep looping.
    Running,
    /// A special tool fired; the run is done.
    Finished,
    /// The tool failed; the output carries the error text for the model.
    Failed,
}

/// Name-keyed collection of callable tools.
///
/// Collisions resolve first-registration-wins: a later tool with an already
/// registered name is skipped with a warning, which also protects the
/// built-ins from being shadowed by an MCP server.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn ToolCaller>>>,
    special: Vec<String>,
    connections: mcp::McpConnections,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish_non_exhaustive()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a registry holding the built-in tools.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            tools: RwLock::new(HashMap::new()),
            special: vec![TERMINATE_TOOL.to_string()],
            connections: mcp::McpConnections::new(),
        };
        registry.register(Arc::new(builtin::CurrentTime));
        registry.register(Arc::new(builtin::Terminate));
        registry
    }

    /// Register a tool. Returns `false` when the name was already taken.
    pub fn register(&self, tool: Arc<dyn ToolCaller>) -> bool {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().expect("tool map poisoned");
        if tools.contains_key(&name) {
            warn!(tool = %name, "tool name already registered, skipping");
            return false;
        }
        tools.insert(name, tool);
        true
    }

    /// Connect every enabled server in `config` and register its tools.
    pub async fn connect_servers(&self, config: &McpServersConfig) -> McpResult<()> {
        for (server_id, spec) in &config.mcp_servers {
            if spec.disabled {
                debug!(server = %server_id, "mcp server disabled, skipping");
                continue;
            }
            self.connect_server(server_id, spec).await?;
        }
        Ok(())
    }

    /// Connect one server and register the tools it advertises.
    pub async fn connect_server(&self, server_id: &str, spec: &McpServerSpec) -> McpResult<()> {
        let tools = self.connections.connect(server_id, spec).await?;
        let mut owned = Vec::with_capacity(tools.len());
        for tool in tools {
            let name = tool.name().to_string();
            if self.register(tool) {
                owned.push(name);
            }
        }
        self.connections.set_owned_tools(server_id, owned);
        Ok(())
    }

    /// Close a server connection and drop the tools it owned.
    pub async fn disconnect(&self, server_id: &str) {
        let owned = self.connections.disconnect(server_id).await;
        let mut tools = self.tools.write().expect("tool map poisoned");
        for name in owned {
            tools.remove(&name);
        }
    }

    /// Close every server connection.
    pub async fn disconnect_all(&self) {
        for server_id in self.connections.server_ids() {
            self.disconnect(&server_id).await;
        }
    }

    /// Descriptors of every registered tool.
    #[must_use]
    pub fn definitions(&self) -> Vec<Tool> {
        self.tools
            .read()
            .expect("tool map poisoned")
            .values()
            .map(|t| t.definition())
            .collect()
    }

    /// Registered tool names.
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .read()
            .expect("tool map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// The registry's tool-usage policy.
    #[must_use]
    pub fn tool_choice(&self) -> ToolChoice {
        ToolChoice::Auto
    }

    /// Execute a model-issued tool call.
    ///
    /// Argument parsing failures, unknown tools and execution errors are
    /// tool-level failures: the error text goes back to the model as the
    /// tool output so it can recover on the next step.
    pub async fn execute(&self, tool_call: &ToolCall) -> (ToolFlow, String) {
        let name = &tool_call.function.name;
        if name.is_empty() {
            return (ToolFlow::Failed, "Error: invalid command format".to_string());
        }

        let tool = {
            let tools = self.tools.read().expect("tool map poisoned");
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return (ToolFlow::Failed, format!("Error: unknown tool {name}"));
        };

        let arguments = match parse_arguments(&tool_call.function.arguments) {
            Ok(arguments) => arguments,
            Err(e) => return (ToolFlow::Failed, format!("Error: {e}")),
        };

        let flow = if self.special.iter().any(|s| s == name) {
            ToolFlow::Finished
        } else {
            ToolFlow::Running
        };

        match tool.call(arguments).await {
            Ok(output) => (flow, output),
            Err(e) => (ToolFlow::Failed, format!("Error: {e}")),
        }
    }
}

/// Parse a JSON argument string; an empty string means an empty map.
fn parse_arguments(raw: &str) -> ToolResult<serde_json::Map<String, serde_json::Value>> {
    if raw.is_empty() {
        return Ok(serde_json::Map::new());
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}
