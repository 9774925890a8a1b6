//! Context management for long sessions.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`token`] | ~4 chars/token estimates with per-message overhead |
//! | [`compaction`] | summarizes the oldest history once the budget is exceeded |

pub mod compaction;
pub mod token;

pub use compaction::{chunk_lines, serialize_message, Compactor, SessionSummary, SUMMARY_PREFIX};
pub use token::{estimate_message_tokens, estimate_messages_tokens, estimate_tokens};
