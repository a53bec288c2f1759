//! Built-in tools available without any MCP server.

use crate::error::{ToolError, ToolResult};
use crate::schema::Tool;
use crate::tool::{TERMINATE_TOOL, ToolCaller};
use async_trait::async_trait;
use chrono::{Local, Utc};
use chrono_tz::Tz;
use serde_json::json;

/// Returns the current date and time, optionally in a given IANA time zone.
pub struct CurrentTime;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[async_trait]
impl ToolCaller for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn definition(&self) -> Tool {
        Tool::function(
            "current_time",
            "Get the current date and time, formatted as YYYY-MM-DD HH:MM:SS. \
             Supports an optional IANA timezone. When asked only for the time, \
             answer with the time; when asked only for the date, answer with \
             the date.",
            json!({
                "type": "object",
                "properties": {
                    "timezone": {
                        "type": "string",
                        "description": "IANA timezone identifier, e.g. Asia/Shanghai",
                        "default": "Local"
                    }
                }
            }),
        )
    }

    async fn call(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> ToolResult<String> {
        let timezone = arguments
            .get("timezone")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        // Unknown or absent zones fall back to local time.
        if !timezone.is_empty()
            && let Ok(tz) = timezone.parse::<Tz>()
        {
            return Ok(Utc::now().with_timezone(&tz).format(TIME_FORMAT).to_string());
        }
        Ok(Local::now().format(TIME_FORMAT).to_string())
    }
}

/// Signals that the interaction is complete.
///
/// Flagged special in the registry: executing it finishes the agent run.
pub struct Terminate;

#[async_trait]
impl ToolCaller for Terminate {
    fn name(&self) -> &str {
        TERMINATE_TOOL
    }

    fn definition(&self) -> Tool {
        Tool::function(
            TERMINATE_TOOL,
            "Call this tool to end the interaction when one of the following \
             holds: 1. the user's request has been fulfilled; 2. the task \
             cannot proceed; 3. more information is needed from the user.",
            json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "description": "Completion status of the interaction",
                        "enum": ["success", "failure"]
                    }
                },
                "required": ["status"]
            }),
        )
    }

    async fn call(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> ToolResult<String> {
        let status = arguments
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing status".to_string()))?;
        if status != "success" && status != "failure" {
            return Err(ToolError::InvalidArguments(format!(
                "invalid status value: {status}"
            )));
        }
        Ok(format!(
            "The interaction has been completed with status: {status}"
        ))
    }
}
