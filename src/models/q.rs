// Amazon Q conversation-state wire format
//
// The request wrapper carries the full conversation: an ordered history of
// user/assistant turns plus the current user message. The upstream requires
// history roles to alternate strictly and rejects empty content strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ==================================================================================================
// Request Models
// ==================================================================================================

/// Top-level structure for the entire JSON body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QApiRequest {
    pub conversation_state: QConversationState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QConversationState {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<QHistoryItem>,
    pub current_message: QCurrentMessage,
    pub chat_trigger_type: String,
}

/// A single history entry: either a user message or an assistant response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QHistoryItem {
    #[serde(rename = "userInputMessage")]
    User(QUserInputHistory),
    #[serde(rename = "assistantResponseMessage")]
    Assistant(QAssistantResponse),
}

impl QHistoryItem {
    pub fn is_user(&self) -> bool {
        matches!(self, QHistoryItem::User(_))
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, QHistoryItem::Assistant(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QCurrentMessage {
    pub user_input_message: QUserInputMessage,
}

/// The most recent user turn in the conversation flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QUserInputMessage {
    pub content: String,
    pub user_input_message_context: QUserInputMessageContext,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<QImage>,
    pub model_id: String,
}

/// A user turn in history; unlike the current message it carries no model id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QUserInputHistory {
    pub content: String,
    pub user_input_message_context: QUserInputMessageContext,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<QImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QAssistantResponse {
    pub message_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<QToolUse>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QUserInputMessageContext {
    pub env_state: QEnvState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<QToolResultItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<QTool>>,
}

/// The user's local environment as reported upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QEnvState {
    pub operating_system: String,
    pub current_working_directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QImage {
    pub format: String,
    pub source: QImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QImageSource {
    pub bytes: String,
}

// ==================================================================================================
// Tool Models
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QTool {
    pub tool_specification: QToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QToolSpecification {
    pub input_schema: QInputSchema,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QInputSchema {
    pub json: Value,
}

/// A tool call made by the assistant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QToolUse {
    pub tool_use_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub input: Value,
}

/// Output from a single tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QToolResultItem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_use_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<QToolResultContent>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// Either text or raw JSON output from a tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QToolResultContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

// ==================================================================================================
// Streaming Models
// ==================================================================================================

/// Payload union of a single upstream event-stream frame.
///
/// Which fields are set decides the event class: `content` for text deltas,
/// `tool_use_id`/`name`/`input`/`stop` for tool deltas, `reason`/`message`
/// for aborts, `conversation_id`/`utterance_id` for ignorable metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QStreamEvent {
    pub content: String,

    pub reason: String,
    pub message: String,

    pub conversation_id: String,
    pub utterance_id: String,

    #[serde(rename = "toolUseId")]
    pub tool_use_id: String,
    pub name: String,
    pub input: String,
    pub stop: bool,
}

// ==================================================================================================
// Model Listing
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QModelsResponse {
    pub default_model: Option<QModel>,
    #[serde(default)]
    pub models: Vec<QModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QModel {
    pub model_id: String,
    #[serde(default)]
    pub model_name: String,
}
