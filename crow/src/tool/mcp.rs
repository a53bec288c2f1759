//! MCP client: connects to configured servers and exposes their tools.
//!
//! Supported transports: stdio (child process), SSE and streamable HTTP.
//! One connection per configured server; the connection owns the tools it
//! registered and takes them along when it is closed.

use crate::error::{McpError, McpResult, ToolError, ToolResult};
use crate::schema::Tool;
use crate::tool::ToolCaller;
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParam, ClientCapabilities, Implementation, InitializeRequestParam},
    service::{RoleClient, RunningService, ServerSink},
    transport::{
        SseClientTransport, StreamableHttpClientTransport, child_process::TokioChildProcess,
    },
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Client identity sent in the MCP initialize handshake.
const CLIENT_NAME: &str = "crow";

/// Transport type of a configured MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum McpTransportKind {
    /// Spawn a child process and talk over stdio.
    #[serde(rename = "stdio")]
    Stdio,
    /// Server-sent events endpoint.
    #[serde(rename = "sse")]
    Sse,
    /// Streamable HTTP endpoint.
    #[serde(rename = "streamableHttp", alias = "streamable-http")]
    StreamableHttp,
}

/// One entry of the MCP server configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerSpec {
    /// Transport type.
    #[serde(rename = "type")]
    pub kind: McpTransportKind,
    /// Command to spawn (stdio only).
    #[serde(default)]
    pub command: String,
    /// Command arguments (stdio only).
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint URL (sse / streamable HTTP).
    #[serde(default)]
    pub url: String,
    /// Skip this server entirely.
    #[serde(default)]
    pub disabled: bool,
}

/// The MCP server configuration file: `{"mcpServers": {...}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    /// Configured servers by id.
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, McpServerSpec>,
}

type McpService = RunningService<RoleClient, InitializeRequestParam>;

/// Live MCP connections keyed by server id.
pub(crate) struct McpConnections {
    sessions: Mutex<HashMap<String, McpService>>,
    owned_tools: std::sync::Mutex<HashMap<String, Vec<String>>>,
}

impl McpConnections {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            owned_tools: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn client_info() -> InitializeRequestParam {
        InitializeRequestParam {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: CLIENT_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        }
    }

    /// Connect to one server and return wrappers for its tools.
    ///
    /// An existing connection under the same id is closed first.
    pub(crate) async fn connect(
        &self,
        server_id: &str,
        spec: &McpServerSpec,
    ) -> McpResult<Vec<Arc<dyn ToolCaller>>> {
        if self.sessions.lock().await.contains_key(server_id) {
            self.disconnect(server_id).await;
        }

        let service = match spec.kind {
            McpTransportKind::Stdio => {
                if spec.command.is_empty() {
                    return Err(McpError::invalid_config(server_id, "command is required"));
                }
                let mut cmd = tokio::process::Command::new(&spec.command);
                cmd.args(&spec.args);
                let transport =
                    TokioChildProcess::new(cmd).map_err(|e| McpError::ProcessSpawnFailed {
                        command: spec.command.clone(),
                        message: e.to_string(),
                    })?;
                Self::client_info().serve(transport).await.map_err(|e| {
                    McpError::ProcessSpawnFailed {
                        command: spec.command.clone(),
                        message: e.to_string(),
                    }
                })?
            }
            McpTransportKind::Sse => {
                if spec.url.is_empty() {
                    return Err(McpError::invalid_config(server_id, "url is required"));
                }
                let transport = SseClientTransport::start(spec.url.clone()).await.map_err(
                    |e| McpError::ConnectionFailed {
                        url: spec.url.clone(),
                        message: e.to_string(),
                    },
                )?;
                Self::client_info().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed {
                        url: spec.url.clone(),
                        message: e.to_string(),
                    }
                })?
            }
            McpTransportKind::StreamableHttp => {
                if spec.url.is_empty() {
                    return Err(McpError::invalid_config(server_id, "url is required"));
                }
                let transport = StreamableHttpClientTransport::from_uri(spec.url.as_str());
                Self::client_info().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed {
                        url: spec.url.clone(),
                        message: e.to_string(),
                    }
                })?
            }
        };

        let sink = service.peer().clone();
        let advertises_tools = service
            .peer_info()
            .map(|peer| peer.capabilities.tools.is_some())
            .unwrap_or(true);

        let tools = if advertises_tools {
            sink.list_tools(Default::default())
                .await
                .map_err(|e| McpError::ListToolsFailed(e.to_string()))?
                .tools
        } else {
            Vec::new()
        };

        info!(server = %server_id, tools = tools.len(), "mcp server connected");
        self.sessions
            .lock()
            .await
            .insert(server_id.to_string(), service);

        Ok(tools
            .into_iter()
            .map(|definition| {
                Arc::new(McpTool {
                    definition,
                    sink: sink.clone(),
                }) as Arc<dyn ToolCaller>
            })
            .collect())
    }

    /// Remember which tool names a server registered.
    pub(crate) fn set_owned_tools(&self, server_id: &str, tools: Vec<String>) {
        self.owned_tools
            .lock()
            .expect("owned tool map poisoned")
            .insert(server_id.to_string(), tools);
    }

    /// Close a connection; returns the tool names it owned.
    pub(crate) async fn disconnect(&self, server_id: &str) -> Vec<String> {
        if let Some(service) = self.sessions.lock().await.remove(server_id) {
            if let Err(e) = service.cancel().await {
                warn!(server = %server_id, error = %e, "mcp disconnect failed");
            }
            info!(server = %server_id, "mcp server disconnected");
        }
        self.owned_tools
            .lock()
            .expect("owned tool map poisoned")
            .remove(server_id)
            .unwrap_or_default()
    }

    /// Ids of every live connection.
    pub(crate) fn server_ids(&self) -> Vec<String> {
        self.owned_tools
            .lock()
            .expect("owned tool map poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// A tool served by a connected MCP server.
pub struct McpTool {
    definition: rmcp::model::Tool,
    sink: ServerSink,
}

#[async_trait]
impl ToolCaller for McpTool {
    fn name(&self) -> &str {
        self.definition.name.as_ref()
    }

    fn definition(&self) -> Tool {
        Tool::function(
            self.definition.name.to_string(),
            self.definition
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            serde_json::to_value(&self.definition.input_schema).unwrap_or_default(),
        )
    }

    async fn call(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> ToolResult<String> {
        let result = self
            .sink
            .call_tool(CallToolRequestParam {
                name: self.definition.name.clone().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| ToolError::execution(format!("call tool failed: {e}")))?;

        let first_text = result
            .content
            .into_iter()
            .find_map(|c| c.raw.as_text().map(|t| t.text.clone()))
            .unwrap_or_default();

        if result.is_error == Some(true) {
            return Err(ToolError::execution(first_text));
        }
        Ok(first_text)
    }
}
