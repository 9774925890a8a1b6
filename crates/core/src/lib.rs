//! # Tandem Core
//!
//! Domain types, traits, and error definitions for the Tandem agent
//! orchestration core. This crate has **no runtime machinery**; it defines
//! the contracts that the orchestrator and the worker pool are written
//! against.
//!
//! ## Collaborators
//!
//! Every external collaborator is a trait here:
//! - [`Provider`]: a language-model backend
//! - [`Tool`] / [`ToolRegistry`]: the tool runtime
//!
//! Implementations live elsewhere, which keeps the orchestration crates
//! testable with scripted stand-ins.

pub mod error;
pub mod message;
pub mod provider;
pub mod selection;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, ToolError};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage};
pub use selection::{ModelSelection, ReasoningEffort, ReasoningParams};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
