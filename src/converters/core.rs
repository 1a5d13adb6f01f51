// Shared conversion logic
//
// Everything both dialect transcoders need: the non-empty content rule, model
// name translation, tool-spec building with long-description relocation, image
// helpers, and the history alternation pass the upstream insists on.

use serde_json::Value;
use uuid::Uuid;

use crate::models::q::{
    QAssistantResponse, QEnvState, QHistoryItem, QInputSchema, QTool, QToolSpecification,
    QUserInputHistory, QUserInputMessageContext,
};

/// Sentinel appended to the current message when thinking mode is requested
pub const THINKING_SENTINEL: &str =
    "<thinking_mode>interleaved</thinking_mode><max_thinking_length>16000</max_thinking_length>";

/// Tool descriptions longer than this move into the message preamble
pub const TOOL_DESCRIPTION_LIMIT: usize = 10_000;

const ORIGIN: &str = "KIRO_CLI";

/// The upstream rejects empty content strings anywhere in the conversation
pub fn ensure_non_empty(raw: &str) -> String {
    if raw.trim().is_empty() {
        "-".to_string()
    } else {
        raw.to_string()
    }
}

/// Environment state attached to every user turn
pub fn env_state() -> QEnvState {
    QEnvState {
        operating_system: "macos".to_string(),
        current_working_directory: ".".to_string(),
    }
}

pub fn origin() -> String {
    ORIGIN.to_string()
}

/// Translates a client-facing model name to the upstream model id.
///
/// The `-thinking` suffix is stripped first, then known aliases collapse.
pub fn map_model_name(model: &str) -> String {
    let model = model.strip_suffix("-thinking").unwrap_or(model);

    if model.starts_with("claude-sonnet-4-5") || model.starts_with("claude-haiku-4-5") {
        "claude-sonnet-4.5".to_string()
    } else if model == "claude-sonnet-4-20250514" {
        "claude-sonnet-4".to_string()
    } else if model.starts_with("claude-3.5-sonnet")
        || model.starts_with("claude-3-5-sonnet")
        || model.starts_with("claude-3-5-haiku")
    {
        "claude-3.5-sonnet".to_string()
    } else {
        model.to_string()
    }
}

/// A dialect-agnostic tool definition heading into the upstream
pub struct ToolSpecInput {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Builds upstream tool specs, relocating oversized descriptions.
///
/// Returns the specs plus a documentation preamble to prepend to the current
/// message content; tools whose description moved there keep only a pointer.
pub fn build_q_tools(tools: Vec<ToolSpecInput>) -> (Vec<QTool>, String) {
    let mut q_tools = Vec::with_capacity(tools.len());
    let mut long_tool_docs = String::new();

    for tool in tools {
        let description = if tool.description.len() > TOOL_DESCRIPTION_LIMIT {
            long_tool_docs.push_str("--- TOOL DOCUMENTATION BEGIN ---\nTool name: ");
            long_tool_docs.push_str(&tool.name);
            long_tool_docs.push_str("\nFull Description: ");
            long_tool_docs.push_str(&tool.description);
            long_tool_docs.push_str("\n--- TOOL DOCUMENTATION END ---\n\n");
            "See tool documentation section.".to_string()
        } else {
            tool.description
        };

        q_tools.push(QTool {
            tool_specification: QToolSpecification {
                input_schema: QInputSchema { json: tool.schema },
                name: tool.name,
                description,
            },
        });
    }

    (q_tools, long_tool_docs)
}

/// Decodes OpenAI tool-call arguments into an upstream tool input.
///
/// - empty/whitespace arguments become `"-"`
/// - a JSON string is decoded, and decoded once more if it held a
///   double-encoded JSON string
/// - anything that fails to decode is carried as the raw string
pub fn tool_input_from_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::Null => Value::String("-".to_string()),
        Value::String(raw) => {
            if raw.trim().is_empty() {
                return Value::String("-".to_string());
            }
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
                    Ok(decoded) => decoded,
                    Err(_) => Value::String(inner),
                },
                Ok(decoded) => decoded,
                Err(_) => Value::String(raw.clone()),
            }
        }
        other => other.clone(),
    }
}

/// Filler assistant turn used to repair alternation
pub fn filler_assistant() -> QHistoryItem {
    QHistoryItem::Assistant(QAssistantResponse {
        message_id: Uuid::new_v4().to_string(),
        content: "-".to_string(),
        tool_uses: None,
    })
}

/// Filler user turn used to repair alternation
pub fn filler_user() -> QHistoryItem {
    QHistoryItem::User(QUserInputHistory {
        content: "-".to_string(),
        user_input_message_context: QUserInputMessageContext {
            env_state: env_state(),
            tool_results: None,
            tools: None,
        },
        origin: origin(),
        images: Vec::new(),
    })
}

/// Repairs the history so adjacent items strictly alternate user/assistant.
///
/// Consecutive same-role items get an empty counterpart inserted between them;
/// no original item is ever dropped.
pub fn normalize_alternation(history: Vec<QHistoryItem>) -> Vec<QHistoryItem> {
    let mut repaired: Vec<QHistoryItem> = Vec::with_capacity(history.len());

    for item in history {
        if let Some(previous) = repaired.last() {
            if previous.is_user() && item.is_user() {
                repaired.push(filler_assistant());
            } else if previous.is_assistant() && item.is_assistant() {
                repaired.push(filler_user());
            }
        }
        repaired.push(item);
    }

    repaired
}

/// Extracts the image format from a data URL header; defaults to png
pub fn image_format_from_data_url(data: &str) -> String {
    if let Some(rest) = data.strip_prefix("data:") {
        if let Some(semicolon) = rest.find(';') {
            let media_type = &rest[..semicolon];
            if let Some(slash) = media_type.rfind('/') {
                return media_type[slash + 1..].to_string();
            }
        }
    }
    "png".to_string()
}

/// Strips a `data:…;base64,` header, leaving the raw base64 payload
pub fn strip_base64_header(data: &str) -> &str {
    match data.find(',') {
        Some(idx) => &data[idx + 1..],
        None => data,
    }
}
