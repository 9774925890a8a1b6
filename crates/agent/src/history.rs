//! History repair after interrupted runs.
//!
//! A run cancelled between "assistant requested tools" and "tool results
//! recorded" leaves call ids without results, which providers reject on the
//! next request. `sanitize_history` answers every orphaned call with a
//! placeholder failure result.

use std::collections::HashSet;
use tandem_core::message::{Message, Role};

/// Content of synthesized results.
pub const INTERRUPTED_TOOL_RESULT: &str =
    "Tool execution was interrupted before a result was recorded.";

/// Insert a placeholder result for every tool call that has none before the
/// next assistant message. Placeholders go right after the call's existing
/// results. Returns how many were inserted; a second pass inserts none.
pub fn sanitize_history(history: &mut Vec<Message>) -> usize {
    let mut synthesized = 0;
    let mut i = 0;

    while i < history.len() {
        if !history[i].has_tool_calls() {
            i += 1;
            continue;
        }

        // Results may only answer this call up to the next assistant turn.
        let window_end = history[i + 1..]
            .iter()
            .position(|m| m.role == Role::Assistant)
            .map_or(history.len(), |offset| i + 1 + offset);
        let answered: HashSet<&str> = history[i + 1..window_end]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        let missing: Vec<Message> = history[i]
            .tool_calls
            .iter()
            .filter(|call| !answered.contains(call.id.as_str()))
            .map(|call| Message::tool_result(&call.id, &call.name, INTERRUPTED_TOOL_RESULT))
            .collect();

        let insert_at = history[i + 1..]
            .iter()
            .position(|m| m.role != Role::Tool)
            .map_or(history.len(), |offset| i + 1 + offset);
        let count = missing.len();
        history.splice(insert_at..insert_at, missing);

        synthesized += count;
        i = insert_at + count;
    }

    synthesized
}
