//! Agent abstraction: a server-side streaming agent that answers one text
//! prompt with many streamed reply fragments.

pub mod react;

pub use react::{ReActAgent, ReActAgentBuilder};

use crate::error::AgentResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No run in progress.
    Idle,
    /// A run is executing.
    Running,
    /// The run ended via a special tool.
    Finished,
    /// The run failed.
    Error,
}

/// State attached to each listener callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// A reply fragment; more will follow.
    Processing,
    /// The run is over; delivered exactly once per run unless aborted.
    Completed,
}

/// Receives streamed agent output.
#[async_trait]
pub trait AgentListener: Send + Sync {
    /// Called for every reply fragment and once on completion.
    ///
    /// Returning `true` stops further delivery for this run and interrupts
    /// the agent.
    async fn on_agent_result(&self, text: &str, state: ReplyState) -> bool;
}

/// A runnable agent.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Attach the listener receiving streamed output.
    fn set_listener(&self, listener: Arc<dyn AgentListener>);

    /// Run one conversation round for `user_prompt`.
    async fn run(&self, user_prompt: &str) -> AgentResult<()>;

    /// Interrupt the current run, if any. The conversation memory is kept.
    fn reset(&self);
}
