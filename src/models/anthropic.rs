// Anthropic messages dialect models

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ==================================================================================================
// Request Models
// ==================================================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub max_tokens: i64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system: AnthropicSystem,
    #[serde(default)]
    pub tools: Vec<AnthropicTool>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

/// The `system` field: a plain string or a list of text blocks
#[derive(Debug, Clone)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

impl Default for AnthropicSystem {
    fn default() -> Self {
        AnthropicSystem::Text(String::new())
    }
}

impl AnthropicSystem {
    pub fn as_text(&self) -> String {
        match self {
            AnthropicSystem::Text(text) => text.clone(),
            AnthropicSystem::Blocks(blocks) => {
                blocks.iter().map(|b| b.text.as_str()).collect()
            }
        }
    }
}

impl<'de> Deserialize<'de> for AnthropicSystem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(AnthropicSystem::Text(s)),
            Value::Array(items) => {
                let blocks = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value(item).ok())
                    .collect();
                Ok(AnthropicSystem::Blocks(blocks))
            }
            _ => Ok(AnthropicSystem::default()),
        }
    }
}

/// Message content: a plain string or an ordered list of typed blocks
#[derive(Debug, Clone)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

impl AnthropicContent {
    pub fn blocks(&self) -> &[AnthropicContentBlock] {
        match self {
            AnthropicContent::Text(_) => &[],
            AnthropicContent::Blocks(blocks) => blocks,
        }
    }

    pub fn first_text(&self) -> &str {
        match self {
            AnthropicContent::Text(text) => text,
            AnthropicContent::Blocks(blocks) => {
                blocks.first().map(|b| b.text.as_str()).unwrap_or("")
            }
        }
    }
}

impl<'de> Deserialize<'de> for AnthropicContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(AnthropicContent::Text(s)),
            Value::Array(items) => {
                let blocks = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value(item).ok())
                    .collect();
                Ok(AnthropicContent::Blocks(blocks))
            }
            _ => Ok(AnthropicContent::Text(String::new())),
        }
    }
}

/// A content block, kept flat so unknown block types (thinking, server tool
/// blocks, documents) deserialize without failing the whole request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnthropicContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,

    // tool_use
    pub id: String,
    pub name: String,
    pub input: Value,

    // tool_result
    pub tool_use_id: String,
    pub content: Value,
}

impl AnthropicContentBlock {
    /// Flattens a tool_result's content, which may be a string or a list of
    /// `{text}` blocks.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub max_uses: i64,
}

// ==================================================================================================
// Response Models
// ==================================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<AnthropicResponseBlock>,
    pub model: String,
    pub stop_reason: String,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicResponseBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnthropicUsage {
    pub input_tokens: i32,
    pub output_tokens: i32,
}

// ==================================================================================================
// Token Counting
// ==================================================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TokenCountRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub system: AnthropicSystem,
    #[serde(default)]
    pub tools: Vec<AnthropicTool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenCountResponse {
    pub input_tokens: i32,
}

// ==================================================================================================
// Model Listing
// ==================================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
    pub has_more: bool,
    pub first_id: String,
    pub last_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub display_name: String,
    pub created_at: String,
}
