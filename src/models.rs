use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway-facing request body for `POST /v1/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
}

/// Request body for `POST /v1/messages/count_tokens`. Same shape as a
/// completion request, but `max_tokens` is not required and never enters
/// the estimate.
#[derive(Debug, Clone, Deserialize)]
pub struct CountTokensRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub tools: Option<Vec<ToolSpec>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

/// One unit of message content. `Image` and `Document` are recognized so
/// the translator can reject them explicitly instead of failing
/// deserialization; unknown tags fail deserialization outright.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        source: Value,
    },
    Document {
        source: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Policy governing whether/which tools the model may invoke. `none`
/// keeps its `name` field so a nonsensical `{type:"none", name:...}` can
/// be rejected instead of silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None {
        #[serde(default)]
        name: Option<String>,
    },
    Any,
    Tool {
        name: String,
    },
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct TokenCountResponse {
    #[serde(rename = "type")]
    pub response_type: &'static str,
    pub input_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub display_name: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
}

// --- Upstream (provider) wire shapes -------------------------------------
//
// The upstream speaks a chat-completions dialect. These projections are
// produced and consumed only by `translate`, `streaming`, and `provider`.

#[derive(Debug, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<UpstreamTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<UpstreamToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<UpstreamStreamOptions>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamStreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<UpstreamToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: UpstreamFunctionDef,
}

#[derive(Debug, Serialize)]
pub struct UpstreamFunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum UpstreamToolChoice {
    Mode(String),
    Tool(UpstreamToolChoiceFunction),
}

#[derive(Debug, Serialize)]
pub struct UpstreamToolChoiceFunction {
    #[serde(rename = "type")]
    pub choice_type: String,
    pub function: UpstreamToolChoiceName,
}

#[derive(Debug, Serialize)]
pub struct UpstreamToolChoiceName {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpstreamToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: UpstreamFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpstreamFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<UpstreamChoice>,
    #[serde(default)]
    pub usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamChoice {
    pub message: UpstreamChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamChoiceMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<UpstreamToolCall>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpstreamUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamStreamChunk {
    pub id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<UpstreamStreamChoice>,
    #[serde(default)]
    pub usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamStreamChoice {
    pub index: u32,
    pub delta: UpstreamStreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpstreamStreamDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<UpstreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub function: Option<UpstreamFunctionCallDelta>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamFunctionCallDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}
