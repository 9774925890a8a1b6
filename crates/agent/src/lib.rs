//! Run orchestration for Tandem.
//!
//! A [`RunOrchestrator`] owns one conversation. Each `send`:
//!
//! 1. **Creates** (or reuses) a per-turn agent for the current model selection
//! 2. **Streams** the agent's progress through an [`event_channel`]
//! 3. **Falls back** to the next configured provider on recoverable failures
//! 4. **Finishes** with `message.complete` or exactly one `error`
//!
//! The default per-turn agent is [`ToolLoopAgent`], which loops over
//! provider calls and tool executions and compacts long histories through a
//! [`Compactor`].

pub mod channel;
pub mod context;
pub mod event;
pub mod history;
pub mod loop_runner;
pub mod orchestrator;
pub mod turn;

pub use channel::{event_channel, ChannelError, EventReceiver, EventSender};
pub use context::{Compactor, SessionSummary};
pub use event::AgentEvent;
pub use history::{sanitize_history, INTERRUPTED_TOOL_RESULT};
pub use loop_runner::{ToolLoopAgent, ToolLoopFactory};
pub use orchestrator::{EventStream, OrchestratorError, OrchestratorOptions, RunOrchestrator};
pub use turn::{AgentFactory, EventSink, TurnAgent};
