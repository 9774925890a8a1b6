//! The per-turn agent contract.
//!
//! A `TurnAgent` runs one think/act/observe loop for a user message and
//! reports progress through an [`EventSink`]. The orchestrator never looks
//! inside; it only creates agents through an [`AgentFactory`], moves history
//! in and out, and asks them to stop.

use std::sync::Arc;
use async_trait::async_trait;
use tandem_core::{Message, ModelSelection, Result};

use crate::event::AgentEvent;

/// Callback used for streaming agent events.
pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

#[async_trait]
pub trait TurnAgent: Send + Sync {
    /// Process one user message to completion and return the final text.
    async fn send(&self, message: &str, explain_edits: bool, sink: EventSink) -> Result<String>;

    /// Replace the agent's history.
    fn load_history(&self, history: Vec<Message>);

    /// Snapshot of the agent's history, including any partial progress of
    /// an interrupted send.
    fn history(&self) -> Vec<Message>;

    fn clear_history(&self);

    /// Best-effort request to stop an in-flight `send`.
    fn cancel(&self, _reason: &str) {}
}

/// Creates per-turn agents bound to a model selection.
pub trait AgentFactory: Send + Sync {
    fn create(&self, selection: &ModelSelection) -> Result<Arc<dyn TurnAgent>>;
}

impl<F> AgentFactory for F
where
    F: Fn(&ModelSelection) -> Result<Arc<dyn TurnAgent>> + Send + Sync,
{
    fn create(&self, selection: &ModelSelection) -> Result<Arc<dyn TurnAgent>> {
        self(selection)
    }
}
