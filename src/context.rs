use std::collections::HashSet;

use crate::error::AppError;
use crate::models::{
    ContentBlock, Message, MessageContent, MessagesRequest, SystemPrompt, ToolSpec,
};
use crate::tools::{tool_result_ids, tool_use_ids};

// Character-based approximation: 1 token ~ 4 characters, plus 15% overhead
// for JSON structure. Kept as integer arithmetic so the estimate is exact
// and locale-independent: tokens = ceil(chars * 115 / 400).
const CHARS_NUMERATOR: u64 = 115;
const CHARS_DENOMINATOR: u64 = 400;

/// A bounded view of the conversation for one in-flight request. Owned by
/// that request alone; the token-budget invariant holds on construction.
#[derive(Debug)]
pub struct ConversationContext {
    pub messages: Vec<Message>,
    pub evicted_messages: usize,
    pub estimated_tokens: u64,
}

/// Assembles the request's history into a context that fits `budget`
/// tokens. Oldest eligible messages are evicted one at a time, with the
/// estimate recomputed after each eviction. System messages and the
/// latest turn are never evicted; if the budget still does not hold once
/// only those remain, the call fails rather than dropping the latest turn.
pub fn assemble(req: &MessagesRequest, budget: u64) -> Result<ConversationContext, AppError> {
    let mut messages = req.messages.clone();
    let mut evicted = 0usize;

    loop {
        let estimated = estimate_request_tokens(
            req.system.as_ref(),
            &messages,
            req.tools.as_deref(),
            req.max_tokens,
        );
        if estimated <= budget {
            return Ok(ConversationContext {
                messages,
                evicted_messages: evicted,
                estimated_tokens: estimated,
            });
        }

        let Some(victim) = eviction_candidate(&messages) else {
            return Err(AppError::context_too_large(format!(
                "conversation requires ~{} tokens but the context window is {}",
                estimated, budget
            )));
        };

        let removed = messages.remove(victim);
        evicted += 1;
        let orphaned: HashSet<String> =
            tool_use_ids(&removed).map(str::to_string).collect();
        if !orphaned.is_empty() {
            drop_orphaned_results(&mut messages, &orphaned);
        }
    }
}

/// Deterministic estimate for a full completion request: input content
/// plus the reserved output budget.
pub fn estimate_request_tokens(
    system: Option<&SystemPrompt>,
    messages: &[Message],
    tools: Option<&[ToolSpec]>,
    max_tokens: u32,
) -> u64 {
    estimate_input_tokens(system, messages, tools) + u64::from(max_tokens)
}

/// Deterministic estimate of input tokens only. This is what
/// `/v1/messages/count_tokens` reports; it never calls the upstream.
pub fn estimate_input_tokens(
    system: Option<&SystemPrompt>,
    messages: &[Message],
    tools: Option<&[ToolSpec]>,
) -> u64 {
    let mut chars = 0u64;

    if let Some(system) = system {
        chars += system_chars(system);
    }
    for message in messages {
        chars += message.role.chars().count() as u64;
        chars += content_chars(&message.content);
    }
    for tool in tools.unwrap_or(&[]) {
        chars += tool.name.chars().count() as u64;
        chars += tool
            .description
            .as_ref()
            .map(|d| d.chars().count() as u64)
            .unwrap_or(0);
        chars += value_chars(&tool.input_schema);
    }

    (chars * CHARS_NUMERATOR).div_ceil(CHARS_DENOMINATOR)
}

/// First message that may be evicted: oldest, not a system message, not
/// the latest turn, and not the issuer of a tool_use the latest turn is
/// answering (evicting that would orphan the caller's own tool_results).
fn eviction_candidate(messages: &[Message]) -> Option<usize> {
    let last = messages.len().checked_sub(1)?;
    let answered_by_last: HashSet<&str> = messages
        .last()
        .map(|m| tool_result_ids(m).collect())
        .unwrap_or_default();

    messages[..last].iter().position(|message| {
        message.role != "system"
            && !tool_use_ids(message).any(|id| answered_by_last.contains(id))
    })
}

/// Removes tool_result blocks whose originating tool_use was evicted, so
/// the truncated context stays well-formed. The latest turn is left
/// untouched (its referenced tool_uses are never evicted).
fn drop_orphaned_results(messages: &mut Vec<Message>, orphaned: &HashSet<String>) {
    let last = messages.len().saturating_sub(1);
    for message in &mut messages[..last] {
        if let MessageContent::Blocks(blocks) = &mut message.content {
            blocks.retain(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => !orphaned.contains(tool_use_id),
                _ => true,
            });
        }
    }
    let len = messages.len();
    messages.retain({
        let mut index = 0;
        move |message| {
            let keep = index + 1 == len || !message.content.is_empty();
            index += 1;
            keep
        }
    });
}

fn system_chars(system: &SystemPrompt) -> u64 {
    match system {
        SystemPrompt::Text(text) => text.chars().count() as u64,
        SystemPrompt::Blocks(blocks) => blocks
            .iter()
            .map(|b| b.text.as_ref().map(|t| t.chars().count() as u64).unwrap_or(0))
            .sum(),
    }
}

fn content_chars(content: &MessageContent) -> u64 {
    match content {
        MessageContent::Text(text) => text.chars().count() as u64,
        MessageContent::Blocks(blocks) => blocks.iter().map(block_chars).sum(),
    }
}

fn block_chars(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } => text.chars().count() as u64,
        ContentBlock::ToolUse { id, name, input } => {
            id.chars().count() as u64 + name.chars().count() as u64 + value_chars(input)
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => tool_use_id.chars().count() as u64 + value_chars(content),
        ContentBlock::Image { source } | ContentBlock::Document { source } => value_chars(source),
    }
}

fn value_chars(value: &serde_json::Value) -> u64 {
    serde_json::to_string(value)
        .map(|s| s.chars().count() as u64)
        .unwrap_or(0)
}
