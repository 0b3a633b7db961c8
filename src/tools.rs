use std::collections::HashSet;

use crate::error::AppError;
use crate::models::{ContentBlock, Message, ToolChoice, ToolSpec};

/// Validates a `tool_choice` against the supplied tool specs before any
/// upstream call: a specific tool must be named and present, and `any`
/// requires at least one tool to pick from.
pub fn resolve_tool_choice(
    choice: &ToolChoice,
    tools: Option<&[ToolSpec]>,
) -> Result<(), AppError> {
    match choice {
        ToolChoice::Auto => Ok(()),
        ToolChoice::None { name } => {
            if name.is_some() {
                return Err(AppError::bad_request(
                    "tool_choice.name must not be set when tool_choice.type is 'none'",
                ));
            }
            Ok(())
        }
        ToolChoice::Any => {
            if tools.is_none_or(|t| t.is_empty()) {
                return Err(AppError::bad_request(
                    "tools must be provided when tool_choice.type is 'any'",
                ));
            }
            Ok(())
        }
        ToolChoice::Tool { name } => {
            if name.trim().is_empty() {
                return Err(AppError::bad_request(
                    "tool_choice.name must be a non-empty string",
                ));
            }
            let known = tools
                .unwrap_or(&[])
                .iter()
                .any(|tool| tool.name == *name);
            if !known {
                return Err(AppError::bad_request(format!(
                    "tool_choice.name '{}' must be present in the tools list",
                    name
                )));
            }
            Ok(())
        }
    }
}

/// Checks that every `tool_result` in the context pairs with a `tool_use`
/// id issued by an earlier assistant turn.
pub fn pair_tool_results(messages: &[Message]) -> Result<(), AppError> {
    let mut issued: HashSet<&str> = HashSet::new();
    for message in messages {
        for block in message.content.blocks() {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    issued.insert(id.as_str());
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    if !issued.contains(tool_use_id.as_str()) {
                        return Err(AppError::unmatched_tool_result(format!(
                            "tool_result references unknown tool_use id '{}'",
                            tool_use_id
                        )));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Tool-use ids issued by one message.
pub fn tool_use_ids(message: &Message) -> impl Iterator<Item = &str> {
    message.content.blocks().iter().filter_map(|block| match block {
        ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
        _ => None,
    })
}

/// Tool-result ids referenced by one message.
pub fn tool_result_ids(message: &Message) -> impl Iterator<Item = &str> {
    message.content.blocks().iter().filter_map(|block| match block {
        ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageContent;
    use serde_json::json;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    fn assistant_tool_use(id: &str, name: &str) -> Message {
        Message {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: json!({}),
            }]),
        }
    }

    fn user_tool_result(id: &str) -> Message {
        Message {
            role: "user".to_string(),
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: id.to_string(),
                content: json!("ok"),
                is_error: None,
            }]),
        }
    }

    #[test]
    fn specific_tool_must_exist() {
        let tools = [spec("get_weather")];
        let choice = ToolChoice::Tool {
            name: "search".to_string(),
        };
        let err = resolve_tool_choice(&choice, Some(&tools)).expect_err("unknown tool");
        assert_eq!(err.kind, crate::error::ErrorKind::BadRequest);

        let choice = ToolChoice::Tool {
            name: "get_weather".to_string(),
        };
        resolve_tool_choice(&choice, Some(&tools)).expect("known tool");
    }

    #[test]
    fn any_requires_tools() {
        resolve_tool_choice(&ToolChoice::Any, None).expect_err("no tools");
        resolve_tool_choice(&ToolChoice::Any, Some(&[spec("a")])).expect("has tools");
    }

    #[test]
    fn auto_and_none_need_no_tools() {
        resolve_tool_choice(&ToolChoice::Auto, None).expect("auto");
        resolve_tool_choice(&ToolChoice::None { name: None }, None).expect("none");
    }

    #[test]
    fn none_must_not_name_a_tool() {
        let choice: ToolChoice = serde_json::from_value(json!({
            "type": "none",
            "name": "get_weather"
        }))
        .expect("deserializes");
        let err = resolve_tool_choice(&choice, Some(&[spec("get_weather")]))
            .expect_err("named none");
        assert_eq!(err.kind, crate::error::ErrorKind::BadRequest);
    }

    #[test]
    fn pairing_accepts_issued_ids() {
        let messages = vec![
            assistant_tool_use("toolu_1", "get_weather"),
            user_tool_result("toolu_1"),
        ];
        pair_tool_results(&messages).expect("paired");
    }

    #[test]
    fn pairing_rejects_unknown_ids() {
        let messages = vec![
            assistant_tool_use("toolu_1", "get_weather"),
            user_tool_result("toolu_2"),
        ];
        let err = pair_tool_results(&messages).expect_err("unmatched");
        assert_eq!(err.kind, crate::error::ErrorKind::UnmatchedToolResult);
    }

    #[test]
    fn multi_tool_turns_pair_independently() {
        let multi = Message {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(vec![
                ContentBlock::ToolUse {
                    id: "toolu_a".to_string(),
                    name: "get_weather".to_string(),
                    input: json!({"city": "Oslo"}),
                },
                ContentBlock::ToolUse {
                    id: "toolu_b".to_string(),
                    name: "get_time".to_string(),
                    input: json!({"tz": "UTC"}),
                },
            ]),
        };
        let messages = vec![multi, user_tool_result("toolu_b"), user_tool_result("toolu_a")];
        pair_tool_results(&messages).expect("both ids issued");
    }
}
