//! Bounded conversation memory with tool-call repair.
//!
//! The memory keeps the message log the agent feeds to the LLM. Two
//! invariants are maintained here:
//!
//! - every assistant tool call is eventually answered by a tool message
//!   (interrupted calls get a synthetic error entry), and
//! - the log never starts with a tool message.
//!
//! Overflow drops whole conversation turns, oldest first. A turn starts at a
//! user message and runs until the next user message; system messages are
//! never evicted.

use crate::schema::{Message, Role};
use std::collections::HashSet;

/// Content of the synthetic tool message appended for interrupted calls.
pub const INTERRUPTED_TOOL_RESULT: &str = "error: tool execution was interrupted";

const DEFAULT_MAX_MESSAGES: usize = 20;

/// Ordered, bounded message log.
#[derive(Debug, Clone)]
pub struct Memory {
    messages: Vec<Message>,
    max_messages: usize,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl Memory {
    /// Create a memory bounded at `max_messages`.
    ///
    /// Bounds of five or fewer are not workable for a tool-calling
    /// conversation and fall back to the default of 20.
    #[must_use]
    pub fn new(max_messages: usize) -> Self {
        let max_messages = if max_messages <= 5 {
            DEFAULT_MAX_MESSAGES
        } else {
            max_messages
        };
        Self {
            messages: Vec::with_capacity(max_messages),
            max_messages,
        }
    }

    /// Append messages, evicting whole turns if the bound is exceeded.
    pub fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
        if self.messages.len() <= self.max_messages {
            return;
        }

        // Evict turn by turn: keep system messages, cut at the first later
        // user message whose tail fits within the bound.
        let mut system_messages: Vec<Message> = Vec::new();
        let mut cut = None;
        let mut seen_user = false;
        for (i, msg) in self.messages.iter().enumerate() {
            match msg.role {
                Role::System => system_messages.push(msg.clone()),
                Role::User => {
                    if seen_user
                        && system_messages.len() + (self.messages.len() - i) <= self.max_messages
                    {
                        cut = Some(i);
                        break;
                    }
                    seen_user = true;
                }
                _ => {}
            }
        }
        if let Some(i) = cut {
            let tail = self.messages.split_off(i);
            self.messages = system_messages;
            self.messages.extend(tail);
        }
    }

    /// Append a single message.
    pub fn add_message(&mut self, message: Message) {
        self.add_messages([message]);
    }

    /// All messages in order.
    #[must_use]
    pub fn get_all(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent `n` messages.
    #[must_use]
    pub fn get_recent(&self, n: usize) -> &[Message] {
        if n == 0 || self.messages.is_empty() {
            return &[];
        }
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Repair the tail of an interrupted turn before a new run starts.
    ///
    /// - A trailing assistant message with empty content or pending tool
    ///   calls is removed; it would otherwise be unanswered.
    /// - A trailing tool message means some of the preceding assistant's
    ///   tool calls may be unanswered; the missing ones get a synthetic
    ///   [`INTERRUPTED_TOOL_RESULT`] entry.
    /// - Leading tool messages (orphaned by turn eviction) are stripped, so
    ///   the log never starts with a tool message.
    pub fn normalize(&mut self) {
        match self.messages.last() {
            Some(last) if last.role == Role::Assistant => {
                if last.content.is_empty() || !last.tool_calls.is_empty() {
                    self.messages.pop();
                }
            }
            Some(last) if last.role == Role::Tool => {
                let mut answered: HashSet<String> = HashSet::new();
                let mut assistant: Option<Message> = None;
                for msg in self.messages.iter().rev() {
                    match msg.role {
                        Role::Tool => {
                            if let Some(id) = &msg.tool_call_id {
                                answered.insert(id.clone());
                            }
                        }
                        Role::Assistant => {
                            assistant = Some(msg.clone());
                            break;
                        }
                        _ => break,
                    }
                }
                if let Some(assistant) = assistant
                    && assistant.tool_calls.len() != answered.len()
                {
                    for call in &assistant.tool_calls {
                        if !answered.contains(&call.id) {
                            self.messages.push(Message::tool(
                                INTERRUPTED_TOOL_RESULT,
                                &call.function.name,
                                &call.id,
                            ));
                        }
                    }
                }
            }
            _ => {}
        }

        let orphans = self
            .messages
            .iter()
            .take_while(|m| m.role == Role::Tool)
            .count();
        if orphans > 0 {
            self.messages.drain(..orphans);
        }
    }
}
