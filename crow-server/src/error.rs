//! Server-side error types and the stable error codes sent to clients.

// ============================================================================
// Client-visible error codes
// ============================================================================

/// Stable error code carried by `error` frames; 0 means OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    code: i32,
    msg: &'static str,
}

impl ErrorCode {
    /// Numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.code
    }

    /// Human-readable message.
    #[must_use]
    pub const fn msg(self) -> &'static str {
        self.msg
    }
}

/// The frame payload could not be parsed or had an unsupported kind.
pub const ERR_INVALID_DATA_TYPE: ErrorCode = ErrorCode {
    code: 10400,
    msg: "invalid data type",
};

/// Something went wrong on our side.
pub const ERR_INTERNAL: ErrorCode = ErrorCode {
    code: 10500,
    msg: "internal error",
};

// ============================================================================
// Server Error
// ============================================================================

/// The main error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Connection-level failure.
    #[error("conn: {0}")]
    Conn(#[from] ConnError),

    /// ASR provider failure.
    #[error("asr: {0}")]
    Asr(String),

    /// TTS provider failure.
    #[error("tts: {0}")]
    Tts(String),

    /// Agent failure.
    #[error("agent: {0}")]
    Agent(#[from] crow::AgentError),

    /// Configuration failure.
    #[error("config: {0}")]
    Config(String),

    /// Serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// IO failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A client frame that cannot be handled.
    #[error("unsupported message type: {0}")]
    UnsupportedMessage(String),
}

impl ServerError {
    /// Create an ASR error.
    #[inline]
    pub fn asr(msg: impl Into<String>) -> Self {
        Self::Asr(msg.into())
    }

    /// Create a TTS error.
    #[inline]
    pub fn tts(msg: impl Into<String>) -> Self {
        Self::Tts(msg.into())
    }

    /// Create a config error.
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, ServerError>;

// ============================================================================
// Connection Errors
// ============================================================================

/// Error type for the framed client connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// The connection is closed; stable error for reads and writes after
    /// close.
    #[error("connection is closed")]
    Closed,

    /// A read or write exceeded its deadline.
    #[error("deadline exceeded")]
    Timeout,

    /// Underlying transport failure.
    #[error("transport: {0}")]
    Transport(String),
}

/// Result type for connection operations.
pub type ConnResult<T> = std::result::Result<T, ConnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ERR_INVALID_DATA_TYPE.code(), 10400);
        assert_eq!(ERR_INTERNAL.code(), 10500);
    }

    #[test]
    fn test_conn_error_converts() {
        let err: ServerError = ConnError::Closed.into();
        assert!(matches!(err, ServerError::Conn(ConnError::Closed)));
    }
}
