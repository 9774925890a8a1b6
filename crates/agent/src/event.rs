//! Agent-level events.
//!
//! `AgentEvent` is what a caller of `RunOrchestrator::send` observes. The
//! per-turn agent produces the progress events (deltas, reasoning, usage,
//! tool lifecycle); the orchestrator owns the framing events (start,
//! complete, fallback, error).
//!
//! Per attempt:
//! - `message.start` is always first
//! - at most one of `message.complete` / `error` ends it
//! - `provider.fallback` ends it without a terminal event, and is followed by
//!   the next attempt's `message.start`

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// A new attempt started against this provider/model.
    #[serde(rename = "message.start")]
    MessageStart { provider: String, model: String },

    /// Partial text token from the LLM.
    #[serde(rename = "message.delta")]
    MessageDelta { content: String },

    /// The turn finished; `content` is the final assistant text.
    #[serde(rename = "message.complete")]
    MessageComplete { content: String },

    /// Partial reasoning ("thinking") output.
    #[serde(rename = "reasoning")]
    Reasoning { content: String },

    /// Token usage for one provider round-trip.
    #[serde(rename = "usage")]
    Usage { usage: tandem_core::Usage },

    /// The agent is calling a tool.
    #[serde(rename = "tool.start")]
    ToolStart {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution completed.
    #[serde(rename = "tool.complete")]
    ToolComplete {
        id: String,
        name: String,
        output: String,
    },

    /// Tool execution failed; the error text was handed back to the model.
    #[serde(rename = "tool.error")]
    ToolError {
        id: String,
        name: String,
        error: String,
    },

    /// Why the agent made a file edit.
    #[serde(rename = "edit.explanation")]
    EditExplanation { tool: String, explanation: String },

    /// The provider failed recoverably; the turn is being retried elsewhere.
    #[serde(rename = "provider.fallback")]
    ProviderFallback {
        from_provider: String,
        from_model: String,
        to_provider: String,
        to_model: String,
        reason: String,
        error: String,
    },

    /// The turn failed for good.
    #[serde(rename = "error")]
    Error { message: String },
}

impl AgentEvent {
    /// Wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message.start",
            Self::MessageDelta { .. } => "message.delta",
            Self::MessageComplete { .. } => "message.complete",
            Self::Reasoning { .. } => "reasoning",
            Self::Usage { .. } => "usage",
            Self::ToolStart { .. } => "tool.start",
            Self::ToolComplete { .. } => "tool.complete",
            Self::ToolError { .. } => "tool.error",
            Self::EditExplanation { .. } => "edit.explanation",
            Self::ProviderFallback { .. } => "provider.fallback",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the whole turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageComplete { .. } | Self::Error { .. })
    }

    /// Events only the orchestrator may emit. Agent callbacks carrying one of
    /// these are dropped so attempt framing stays intact.
    pub(crate) fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::MessageStart { .. }
                | Self::MessageComplete { .. }
                | Self::ProviderFallback { .. }
                | Self::Error { .. }
        )
    }
}
