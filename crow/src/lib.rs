//! Crow core: the agent side of a real-time voice assistant.
//!
//! This crate holds everything a conversation round needs that is not tied
//! to the transport: the message [`schema`], the bounded conversation
//! [`memory`], a streaming [`llm`] client, the [`tool`] registry with its
//! MCP client, and the ReAct [`agent`] loop that ties them together.
//!
//! The WebSocket orchestrator lives in the `crow-server` crate.

pub mod agent;
pub mod error;
pub mod llm;
pub mod memory;
pub mod prompt;
pub mod schema;
pub mod tool;

pub use agent::{AgentListener, AgentProvider, ReActAgent, ReplyState};
pub use error::{AgentError, AgentResult};
pub use llm::{ChatRequest, ChatResponse, Llm, OpenAiClient, StreamDelta};
pub use memory::Memory;
pub use schema::{Message, Role, Tool, ToolCall, ToolChoice};
pub use tool::{McpServersConfig, ToolRegistry};
