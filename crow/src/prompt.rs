//! Prompt templates for the voice-assistant agent.

use crate::schema::Tool;

/// System prompt; `{tools}` is replaced by the rendered tool catalog.
const SYSTEM_PROMPT: &str = "You are Crow, a voice assistant. Your replies are \
read aloud to the user, so keep them short, conversational and free of \
markup. Answer in the user's language.\n\n\
You can call tools to look things up or act on the user's behalf. The \
available tools are:\n\n{tools}\
When the user's request is fulfilled, when you cannot proceed, or when you \
need more information from the user, call the `terminate` tool to end the \
interaction.";

/// Prompt appended before each think step.
pub const NEXT_STEP_PROMPT: &str = "Decide the next step: either answer the \
user directly or call a tool. If the conversation is complete, call \
`terminate`.";

/// Render the tool catalog section of the system prompt.
#[must_use]
pub fn render_tool_catalog(tools: &[Tool]) -> String {
    let mut catalog = String::new();
    for tool in tools {
        let info = serde_json::json!({
            "name": tool.function.name,
            "description": tool.function.description,
            "properties": tool.function.parameters.get("properties"),
        });
        catalog.push_str(&format!("<tool>\n{info}\n</tool>\n\n"));
    }
    catalog
}

/// Build the full system prompt for the given tools.
#[must_use]
pub fn system_prompt(tools: &[Tool]) -> String {
    SYSTEM_PROMPT.replace("{tools}", &render_tool_catalog(tools))
}
