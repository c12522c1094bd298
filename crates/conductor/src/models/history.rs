//! Conversation history maintenance.
//!
//! Providers reject requests where a tool call is not answered by a tool result in the
//! following message (or where a result answers nothing), so every request is built from a
//! sanitized copy of the history.
use std::collections::HashSet;

use super::content::ContentBlock;
use super::message::Message;

fn call_ids(message: &Message) -> HashSet<&str> {
    message
        .tool_calls()
        .into_iter()
        .map(|call| call.id.as_str())
        .collect()
}

fn result_ids(message: &Message) -> HashSet<&str> {
    message
        .tool_results()
        .into_iter()
        .map(|result| result.id.as_str())
        .collect()
}

/// Drop every tool call that is not answered in the next message and every tool result
/// that does not answer a call in the previous message.
///
/// Messages left empty by the pass are removed. Pairs that survive sit in adjacent
/// non-empty messages, so running the pass again changes nothing.
pub fn sanitize(history: &[Message]) -> Vec<Message> {
    let mut sanitized = Vec::with_capacity(history.len());

    for (index, message) in history.iter().enumerate() {
        let previous_calls = index
            .checked_sub(1)
            .map(|i| call_ids(&history[i]))
            .unwrap_or_default();
        let next_results = history.get(index + 1).map(result_ids).unwrap_or_default();

        let mut kept = message.clone();
        kept.content.retain(|block| match block {
            ContentBlock::ToolCall(call) => next_results.contains(call.id.as_str()),
            ContentBlock::ToolResult(result) => previous_calls.contains(result.id.as_str()),
            _ => true,
        });

        let dropped = message.content.len() - kept.content.len();
        if dropped > 0 {
            tracing::debug!(index, dropped, "dropped unpaired tool blocks from history");
            if kept.content.is_empty() {
                continue;
            }
        }
        sanitized.push(kept);
    }

    sanitized
}

/// Keep at most `limit` of the newest messages, then sanitize the result
pub fn trim_history(history: &[Message], limit: Option<usize>) -> Vec<Message> {
    let start = match limit {
        Some(limit) if history.len() > limit => history.len() - limit,
        _ => 0,
    };
    sanitize(&history[start..])
}
