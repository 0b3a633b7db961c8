use serde_json::Value;

use crate::error::AppError;
use crate::models::{
    ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse, SystemPrompt,
    ToolChoice, ToolSpec, Usage, UpstreamFunctionDef, UpstreamMessage, UpstreamRequest,
    UpstreamResponse, UpstreamStreamOptions, UpstreamTool, UpstreamToolCall, UpstreamToolChoice,
    UpstreamToolChoiceFunction, UpstreamToolChoiceName,
};

/// Projects a validated gateway request onto the upstream chat-completions
/// dialect. `messages` is the truncated context, `model` the resolved
/// upstream model name.
pub fn to_upstream(
    req: &MessagesRequest,
    messages: &[Message],
    model: String,
    stream: bool,
) -> Result<UpstreamRequest, AppError> {
    let mut upstream = Vec::with_capacity(messages.len() + 1);

    if let Some(system) = &req.system {
        let text = flatten_system(system);
        if !text.is_empty() {
            upstream.push(UpstreamMessage {
                role: "system".to_string(),
                content: Some(text),
                tool_calls: None,
                tool_call_id: None,
            });
        }
    }

    for message in messages {
        match message.role.as_str() {
            "system" => upstream.push(UpstreamMessage {
                role: "system".to_string(),
                content: Some(text_of(&message.content)?),
                tool_calls: None,
                tool_call_id: None,
            }),
            "user" => translate_user(message, &mut upstream)?,
            "assistant" => upstream.push(translate_assistant(message)?),
            other => {
                return Err(AppError::bad_request(format!(
                    "unsupported message role '{}'",
                    other
                )));
            }
        }
    }

    Ok(UpstreamRequest {
        model,
        messages: upstream,
        max_completion_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        stream: stream.then_some(true),
        tools: req.tools.as_deref().map(translate_tools),
        tool_choice: req.tool_choice.as_ref().map(translate_tool_choice),
        stream_options: stream.then_some(UpstreamStreamOptions {
            include_usage: true,
        }),
    })
}

/// Projects a unary upstream response back onto the Messages shape.
/// Responses the upstream contract promises but does not deliver (no
/// choices, empty content, undecodable tool arguments) are protocol
/// errors, not silent empties.
pub fn from_upstream(
    response: UpstreamResponse,
    requested_model: &str,
) -> Result<MessagesResponse, AppError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AppError::upstream_protocol("upstream response contained no choices"))?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content
        && !text.is_empty()
    {
        content.push(ContentBlock::Text { text });
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        content.push(tool_call_to_block(call)?);
    }
    if content.is_empty() {
        return Err(AppError::upstream_protocol(
            "upstream response carried neither text nor tool calls",
        ));
    }

    let usage = response.usage.map_or(
        Usage {
            input_tokens: 0,
            output_tokens: 0,
        },
        |u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        },
    );

    Ok(MessagesResponse {
        id: response.id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: requested_model.to_string(),
        content,
        stop_reason: map_finish_reason(choice.finish_reason.as_deref()).to_string(),
        stop_sequence: None,
        usage,
    })
}

/// Upstream `finish_reason` to Messages `stop_reason`. Unknown reasons
/// collapse to `end_turn` rather than leaking the upstream vocabulary.
pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls") | Some("function_call") => "tool_use",
        _ => "end_turn",
    }
}

pub fn tool_call_to_block(call: UpstreamToolCall) -> Result<ContentBlock, AppError> {
    let input = parse_arguments(&call.function.arguments)?;
    Ok(ContentBlock::ToolUse {
        id: call.id,
        name: call.function.name,
        input,
    })
}

/// Tool-call arguments arrive as a JSON-encoded string; an empty string
/// stands for no arguments.
pub fn parse_arguments(arguments: &str) -> Result<Value, AppError> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(arguments).map_err(|e| {
        AppError::upstream_protocol(format!("upstream tool arguments are not valid JSON: {}", e))
    })
}

fn translate_user(message: &Message, out: &mut Vec<UpstreamMessage>) -> Result<(), AppError> {
    match &message.content {
        MessageContent::Text(text) => {
            out.push(UpstreamMessage {
                role: "user".to_string(),
                content: Some(text.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
            Ok(())
        }
        MessageContent::Blocks(blocks) => {
            // Tool results become `tool` role messages and must precede the
            // user text so they directly follow the assistant's tool_calls.
            let mut texts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => out.push(UpstreamMessage {
                        role: "tool".to_string(),
                        content: Some(result_text(content)),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id.clone()),
                    }),
                    ContentBlock::ToolUse { .. } => {
                        return Err(AppError::bad_request(
                            "tool_use blocks are only valid in assistant messages",
                        ));
                    }
                    ContentBlock::Image { .. } => {
                        return Err(AppError::unsupported_feature(
                            "image content blocks are not supported",
                        ));
                    }
                    ContentBlock::Document { .. } => {
                        return Err(AppError::unsupported_feature(
                            "document content blocks are not supported",
                        ));
                    }
                }
            }
            if !texts.is_empty() {
                out.push(UpstreamMessage {
                    role: "user".to_string(),
                    content: Some(texts.join("\n")),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            Ok(())
        }
    }
}

fn translate_assistant(message: &Message) -> Result<UpstreamMessage, AppError> {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    match &message.content {
        MessageContent::Text(text) => texts.push(text.as_str()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(UpstreamToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: crate::models::UpstreamFunctionCall {
                                name: name.clone(),
                                arguments: input.to_string(),
                            },
                        });
                    }
                    ContentBlock::ToolResult { .. } => {
                        return Err(AppError::bad_request(
                            "tool_result blocks are only valid in user messages",
                        ));
                    }
                    ContentBlock::Image { .. } | ContentBlock::Document { .. } => {
                        return Err(AppError::unsupported_feature(
                            "image and document content blocks are not supported",
                        ));
                    }
                }
            }
        }
    }
    Ok(UpstreamMessage {
        role: "assistant".to_string(),
        content: (!texts.is_empty()).then(|| texts.join("\n")),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    })
}

fn translate_tools(tools: &[ToolSpec]) -> Vec<UpstreamTool> {
    tools
        .iter()
        .map(|tool| UpstreamTool {
            tool_type: "function".to_string(),
            function: UpstreamFunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect()
}

fn translate_tool_choice(choice: &ToolChoice) -> UpstreamToolChoice {
    match choice {
        ToolChoice::Auto => UpstreamToolChoice::Mode("auto".to_string()),
        ToolChoice::None { .. } => UpstreamToolChoice::Mode("none".to_string()),
        ToolChoice::Any => UpstreamToolChoice::Mode("required".to_string()),
        ToolChoice::Tool { name } => UpstreamToolChoice::Tool(UpstreamToolChoiceFunction {
            choice_type: "function".to_string(),
            function: UpstreamToolChoiceName { name: name.clone() },
        }),
    }
}

fn flatten_system(system: &SystemPrompt) -> String {
    match system {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn text_of(content: &MessageContent) -> Result<String, AppError> {
    match content {
        MessageContent::Text(text) => Ok(text.clone()),
        MessageContent::Blocks(blocks) => {
            let mut texts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    _ => {
                        return Err(AppError::bad_request(
                            "system messages may only contain text",
                        ));
                    }
                }
            }
            Ok(texts.join("\n"))
        }
    }
}

fn result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
