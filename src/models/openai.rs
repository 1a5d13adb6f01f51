// OpenAI chat/completions dialect models

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ==================================================================================================
// Request Models
// ==================================================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub max_tokens: i64,
    #[serde(default, rename = "reasoning_effort")]
    pub reasoning_effort: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<RequestToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

/// Message content: either a plain string or an ordered list of typed parts
#[derive(Debug, Clone)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Flattens the content into a single string; part texts are joined with
    /// trailing newlines the way multi-part prompts are usually rendered.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&part.text);
                    out.push('\n');
                }
                out
            }
        }
    }

    pub fn parts(&self) -> &[ContentPart] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Parts(parts) => parts,
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accept a string, a part list, or anything else (treated as empty),
        // mirroring how permissive real-world clients are with this field.
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(MessageContent::Text(s)),
            Value::Array(items) => {
                let parts = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value(item).ok())
                    .collect();
                Ok(MessageContent::Parts(parts))
            }
            _ => Ok(MessageContent::default()),
        }
    }
}

impl Serialize for MessageContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            MessageContent::Text(s) => serializer.serialize_str(s),
            MessageContent::Parts(parts) => parts.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A tool call on an inbound assistant message. Arguments arrive either as a
/// JSON string (the OpenAI wire shape) or as an already-decoded object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: String,
    pub function: RequestFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default)]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

// ==================================================================================================
// Response Models
// ==================================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: i32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ResponseToolCall>,
}

/// A completed tool call in an aggregated response. `arguments` is always a
/// string holding syntactically valid JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseToolCall {
    pub index: i32,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ResponseFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

// ==================================================================================================
// Streaming Models
// ==================================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SseChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<SseChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SseChoice {
    pub index: i32,
    pub delta: SseDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SseDelta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(rename = "reasoning_content", skip_serializing_if = "String::is_empty")]
    pub reasoning_content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<SseToolCall>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SseToolCall {
    pub index: i32,
    pub function: SseFunctionCall,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SseFunctionCall {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arguments: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
}

// ==================================================================================================
// Model Listing
// ==================================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}
