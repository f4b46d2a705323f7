use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, Message, SystemContentBlock, ToolResultBlock,
    ToolResultContentBlock, ToolResultStatus, ToolUseBlock,
};
use convo_core::{ConvoError, Item, MessageRole, ModelRequest, Result};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use crate::json_to_document;

const CONTINUATION_PROMPT: &str = "Continue the conversation.";

/// Splits a request into Converse messages and system blocks.
///
/// System items become system blocks after the request's own system prompt.
/// Tool calls ride on assistant messages and tool results on user messages;
/// consecutive blocks with the same role share one message. Converse needs
/// the first message to come from the user, so a log that opens with the
/// assistant gets a short user prompt in front.
///
/// Tool calls and results whose partner is not in the request are left out;
/// Converse rejects a `toolResult` without its `toolUse` and the reverse.
pub fn to_converse_input(request: &ModelRequest) -> Result<(Vec<Message>, Vec<SystemContentBlock>)> {
    let mut system = Vec::new();
    if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        system.push(SystemContentBlock::Text(prompt.to_string()));
    }

    let paired = paired_call_ids(&request.items);

    let mut turns: Vec<(ConversationRole, Vec<ContentBlock>)> = Vec::new();
    for item in &request.items {
        if let Some(call_id) = item.call_id() {
            if !paired.contains(call_id) {
                debug!("Dropping unpaired tool item {}", call_id);
                continue;
            }
        }

        let (role, block) = match item {
            Item::Message {
                role: MessageRole::System,
                content,
            } => {
                system.push(SystemContentBlock::Text(content.clone()));
                continue;
            }
            Item::Message { role, content } => {
                let role = match role {
                    MessageRole::Assistant => ConversationRole::Assistant,
                    _ => ConversationRole::User,
                };
                (role, ContentBlock::Text(content.clone()))
            }
            Item::ToolCall {
                call_id,
                name,
                arguments,
            } => (ConversationRole::Assistant, tool_use_block(call_id, name, arguments)?),
            Item::ToolResult { call_id, output, .. } => {
                (ConversationRole::User, tool_result_block(call_id, output)?)
            }
        };

        match turns.last_mut() {
            Some((last_role, blocks)) if *last_role == role => blocks.push(block),
            _ => turns.push((role, vec![block])),
        }
    }

    if matches!(turns.first(), Some((ConversationRole::Assistant, _))) {
        debug!("Log opens with an assistant message, prepending a user prompt");
        turns.insert(
            0,
            (
                ConversationRole::User,
                vec![ContentBlock::Text(CONTINUATION_PROMPT.to_string())],
            ),
        );
    }

    let messages = turns
        .into_iter()
        .map(|(role, blocks)| {
            Message::builder()
                .role(role)
                .set_content(Some(blocks))
                .build()
                .map_err(|e| ConvoError::ModelError(format!("Failed to build message: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((messages, system))
}

/// Call ids that have both a tool-call and a tool-result in `items`.
fn paired_call_ids(items: &[Item]) -> HashSet<&str> {
    let mut calls = HashSet::new();
    let mut results = HashSet::new();
    for item in items {
        match item {
            Item::ToolCall { call_id, .. } => {
                calls.insert(call_id.as_str());
            }
            Item::ToolResult { call_id, .. } => {
                results.insert(call_id.as_str());
            }
            Item::Message { .. } => {}
        }
    }
    calls.intersection(&results).copied().collect()
}

fn tool_use_block(call_id: &str, name: &str, arguments: &Value) -> Result<ContentBlock> {
    let block = ToolUseBlock::builder()
        .tool_use_id(call_id)
        .name(name)
        .input(json_to_document(arguments)?)
        .build()
        .map_err(|e| ConvoError::ModelError(format!("Failed to build tool use block: {e}")))?;
    Ok(ContentBlock::ToolUse(block))
}

fn tool_result_block(call_id: &str, output: &Value) -> Result<ContentBlock> {
    let content = match output {
        Value::Object(_) => ToolResultContentBlock::Json(json_to_document(output)?),
        Value::String(text) => ToolResultContentBlock::Text(text.clone()),
        other => ToolResultContentBlock::Text(other.to_string()),
    };

    let mut builder = ToolResultBlock::builder().tool_use_id(call_id).content(content);
    if output.get("error").is_some() {
        builder = builder.status(ToolResultStatus::Error);
    }

    let block = builder
        .build()
        .map_err(|e| ConvoError::ModelError(format!("Failed to build tool result: {e}")))?;
    Ok(ContentBlock::ToolResult(block))
}
