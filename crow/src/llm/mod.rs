//! Streaming chat-completion client abstraction.
//!
//! The agent talks to a model through the [`Llm`] trait: one
//! [`Llm::handle`] call per think step. Content deltas are pushed into a
//! bounded channel as they arrive so a listener can mirror them in real
//! time; the aggregated response (content plus tool calls) is the return
//! value once the stream ends.

mod openai;

pub use openai::{OpenAiClient, OpenAiClientBuilder};

use crate::error::LlmResult;
use crate::schema::{Message, Tool, ToolCall, ToolChoice};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Capacity of the delta channel handed to [`Llm::handle`].
pub const DELTA_CHANNEL_CAPACITY: usize = 64;

/// One item of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    /// A fragment of assistant content.
    Content(String),
    /// A content or tool-call block finished; more blocks may follow.
    Final,
}

/// A chat-completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Per-request timeout; defaults to [`DEFAULT_REQUEST_TIMEOUT`].
    pub timeout: Option<Duration>,
    /// Tool usage policy.
    pub tool_choice: ToolChoice,
    /// Tools advertised to the model.
    pub tools: Vec<Tool>,
    /// Optional system message prepended to the context.
    pub system_message: Option<Message>,
    /// Conversation context. Must contain at least one user message.
    pub messages: Vec<Message>,
    /// Whether user images are forwarded to the model.
    pub supports_images: bool,
}

/// The aggregated result of a streamed completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Full assistant content.
    pub content: String,
    /// Tool calls the model wants executed, in order.
    pub tool_calls: Vec<ToolCall>,
}

/// A streaming chat model.
///
/// `handle` drives one completion: every content delta is sent into
/// `deltas` as it arrives, a [`StreamDelta::Final`] marker follows each
/// finished block, and the channel closes when the stream ends. Refusals
/// surface as an error on the return path, not through the channel.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Run one streaming completion.
    async fn handle(
        &self,
        request: ChatRequest,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> LlmResult<ChatResponse>;
}
