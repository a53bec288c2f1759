//! Message and tool schema shared by the LLM client, memory and agent.

use serde::{Deserialize, Serialize};

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output, possibly carrying tool calls.
    Assistant,
    /// Result of a tool call.
    Tool,
}

/// How the model is allowed to use tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Tools are disabled.
    None,
    /// The model decides.
    #[default]
    Auto,
    /// The model must call a tool.
    Required,
}

/// Function half of a tool descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Tool name.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// JSON-schema parameters object.
    pub parameters: serde_json::Value,
}

/// A tool descriptor advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The function definition.
    pub function: ToolFunction,
}

impl Tool {
    /// Create a function tool descriptor.
    #[must_use]
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function half of a tool call requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as a JSON-encoded string.
    pub arguments: String,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, echoed back in the matching tool message.
    pub id: String,
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The requested function and its arguments.
    pub function: ToolCallFunction,
}

impl ToolCall {
    /// Create a function tool call.
    #[must_use]
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// One entry of the conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: Role,
    /// Text content; may be empty for assistant messages that only carry
    /// tool calls.
    pub content: String,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Name of the tool a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the tool call a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Optional base64 image attached to a user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_image: Option<String>,
}

impl Message {
    /// A user message, optionally with an attached base64 image.
    #[must_use]
    pub fn user(content: impl Into<String>, base64_image: Option<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
            base64_image,
        }
    }

    /// A system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
            base64_image: None,
        }
    }

    /// An assistant message with plain content.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
            base64_image: None,
        }
    }

    /// An assistant message carrying tool calls.
    #[must_use]
    pub fn from_tool_calls(tool_calls: Vec<ToolCall>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            name: None,
            tool_call_id: None,
            base64_image: None,
        }
    }

    /// A tool message answering `tool_call_id`.
    #[must_use]
    pub fn tool(
        content: impl Into<String>,
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            name: Some(name.into()),
            tool_call_id: Some(tool_call_id.into()),
            base64_image: None,
        }
    }
}
