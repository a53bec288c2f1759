//! Unified error types for the crow core library.
//!
//! Each subsystem (LLM, tools, MCP, agent) has its own error enum; all of
//! them convert into the top-level [`AgentError`].

// ============================================================================
// Agent Error
// ============================================================================

/// The main error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// LLM request/stream error.
    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    /// Tool execution error.
    #[error("tool: {0}")]
    Tool(#[from] ToolError),

    /// MCP client error.
    #[error("mcp: {0}")]
    Mcp(#[from] McpError),

    /// The user prompt was empty.
    #[error("user prompt is empty")]
    EmptyPrompt,

    /// No steps were executed during a run.
    #[error("no steps executed")]
    NoStepsExecuted,

    /// A step failed.
    #[error("error executing step {step}: {message}")]
    Step {
        /// 1-based step index.
        step: usize,
        /// What went wrong.
        message: String,
    },
}

impl AgentError {
    /// Create a step error.
    #[inline]
    pub fn step(step: usize, message: impl Into<String>) -> Self {
        Self::Step {
            step,
            message: message.into(),
        }
    }
}

/// Result type alias for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

// ============================================================================
// LLM Errors
// ============================================================================

/// Error type for LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP transport error.
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),

    /// The API returned a non-success status.
    #[error("api status {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The model refused to answer.
    #[error("refusal: {0}")]
    Refusal(String),

    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The stream produced no usable response.
    #[error("no response received")]
    NoResponse,

    /// The request exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Failed to decode a stream chunk.
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LlmError {
    /// Create an invalid-request error.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

/// Result type for LLM operations.
pub type LlmResult<T> = std::result::Result<T, LlmError>;

// ============================================================================
// Tool Errors
// ============================================================================

/// Error type for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The requested tool is not registered.
    #[error("unknown tool: {0}")]
    Unknown(String),

    /// Tool arguments could not be parsed.
    #[error("failed to parse arguments: {0}")]
    InvalidArguments(String),

    /// The tool itself failed.
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    /// Create an execution error.
    #[inline]
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}

/// Result type for tool execution.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

// ============================================================================
// MCP Errors
// ============================================================================

/// Error type for MCP client operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The server configuration is invalid.
    #[error("invalid server config for {server}: {message}")]
    InvalidConfig {
        /// Server id from the configuration file.
        server: String,
        /// What is wrong with it.
        message: String,
    },

    /// Failed to spawn a stdio server process.
    #[error("failed to spawn {command}: {message}")]
    ProcessSpawnFailed {
        /// The command that was executed.
        command: String,
        /// Underlying error.
        message: String,
    },

    /// Failed to connect to a remote server.
    #[error("failed to connect to {url}: {message}")]
    ConnectionFailed {
        /// Server URL.
        url: String,
        /// Underlying error.
        message: String,
    },

    /// `tools/list` failed.
    #[error("list tools failed: {0}")]
    ListToolsFailed(String),

    /// `tools/call` failed.
    #[error("tool call failed: {0}")]
    ToolCallFailed(String),
}

impl McpError {
    /// Create an invalid-config error.
    #[inline]
    pub fn invalid_config(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            server: server.into(),
            message: message.into(),
        }
    }
}

/// Result type for MCP operations.
pub type McpResult<T> = std::result::Result<T, McpError>;
