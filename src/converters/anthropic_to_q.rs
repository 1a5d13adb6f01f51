// Anthropic messages -> Amazon Q conversation state

use serde_json::Value;
use uuid::Uuid;

use crate::models::anthropic::{AnthropicContent, AnthropicContentBlock, AnthropicRequest};
use crate::models::q::{
    QApiRequest, QAssistantResponse, QConversationState, QCurrentMessage, QHistoryItem,
    QToolResultContent, QToolResultItem, QToolUse, QUserInputHistory, QUserInputMessage,
    QUserInputMessageContext,
};

use super::core::{
    build_q_tools, ensure_non_empty, env_state, filler_assistant, map_model_name,
    normalize_alternation, origin, ToolSpecInput, THINKING_SENTINEL,
};

/// Builds the upstream request from an Anthropic messages request.
///
/// The upstream has no dedicated system field, so a non-empty system prompt
/// is injected as the first user turn followed by an empty assistant
/// acknowledgement to keep the alternation intact.
pub fn map_anthropic_request(
    req: &AnthropicRequest,
    conversation_id: &str,
) -> Result<QApiRequest, String> {
    let model_id = map_model_name(&req.model);

    let (q_tools, long_tool_docs) = build_q_tools(
        req.tools
            .iter()
            .map(|tool| ToolSpecInput {
                name: tool.name.clone(),
                description: tool.description.clone(),
                schema: tool.input_schema.clone(),
            })
            .collect(),
    );

    let mut history: Vec<QHistoryItem> = Vec::new();

    let system_text = req.system.as_text();
    if !system_text.is_empty() {
        history.push(user_history_item(
            format!(
                "--- SYSTEM PROMPT BEGIN ---\n{}\n--- SYSTEM PROMPT END ---\n\n",
                ensure_non_empty(&system_text)
            ),
            None,
        ));
        history.push(filler_assistant());
    }

    for msg in &req.messages {
        match msg.role.as_str() {
            "assistant" => history.push(assistant_item(&msg.content)),
            "user" => history.push(user_item(&msg.content)),
            _ => {}
        }
    }

    let mut history = normalize_alternation(history);

    let mut current = QUserInputMessage {
        content: "-".to_string(),
        user_input_message_context: QUserInputMessageContext {
            env_state: env_state(),
            tool_results: None,
            tools: if q_tools.is_empty() {
                None
            } else {
                Some(q_tools)
            },
        },
        origin: origin(),
        images: Vec::new(),
        model_id,
    };

    if history.last().is_some_and(|item| item.is_user()) {
        if let Some(QHistoryItem::User(user)) = history.pop() {
            current.content = format!("{}{}", long_tool_docs, user.content);
            current.user_input_message_context.tool_results =
                user.user_input_message_context.tool_results;
        }
    } else if !history.is_empty() {
        // Trailing assistant turn stays in history; current carries only the
        // relocated tool documentation, if any.
        current.content = long_tool_docs;
    }

    current.content = ensure_non_empty(&current.content);

    if req.model.ends_with("-thinking") {
        current.content.push_str(THINKING_SENTINEL);
    }

    Ok(QApiRequest {
        conversation_state: QConversationState {
            conversation_id: conversation_id.to_string(),
            history,
            current_message: QCurrentMessage {
                user_input_message: current,
            },
            chat_trigger_type: "MANUAL".to_string(),
        },
    })
}

fn user_history_item(
    content: String,
    tool_results: Option<Vec<QToolResultItem>>,
) -> QHistoryItem {
    QHistoryItem::User(QUserInputHistory {
        content,
        user_input_message_context: QUserInputMessageContext {
            env_state: env_state(),
            tool_results,
            tools: None,
        },
        origin: origin(),
        images: Vec::new(),
    })
}

fn assistant_item(content: &AnthropicContent) -> QHistoryItem {
    match content {
        AnthropicContent::Text(text) => QHistoryItem::Assistant(QAssistantResponse {
            message_id: Uuid::new_v4().to_string(),
            content: ensure_non_empty(text),
            tool_uses: None,
        }),
        AnthropicContent::Blocks(blocks) => {
            let mut text = String::new();
            let mut tool_uses: Vec<QToolUse> = Vec::new();

            for block in blocks {
                match block.block_type.as_str() {
                    "text" => text.push_str(&block.text),
                    "tool_use" => tool_uses.push(QToolUse {
                        tool_use_id: block.id.clone(),
                        name: block.name.clone(),
                        input: block.input.clone(),
                    }),
                    _ => {
                        if !block.text.is_empty() {
                            text.push_str(&block.text);
                        }
                    }
                }
            }

            QHistoryItem::Assistant(QAssistantResponse {
                message_id: Uuid::new_v4().to_string(),
                content: ensure_non_empty(&text),
                tool_uses: if tool_uses.is_empty() {
                    None
                } else {
                    Some(tool_uses)
                },
            })
        }
    }
}

fn user_item(content: &AnthropicContent) -> QHistoryItem {
    match content {
        AnthropicContent::Text(text) => user_history_item(ensure_non_empty(text), None),
        AnthropicContent::Blocks(blocks) => {
            let mut text = String::new();
            let mut tool_results: Vec<QToolResultItem> = Vec::new();

            for block in blocks {
                match block.block_type.as_str() {
                    "text" => text.push_str(&block.text),
                    "tool_result" => tool_results.push(tool_result_item(block)),
                    _ => {
                        if !block.text.is_empty() {
                            text.push_str(&block.text);
                        }
                    }
                }
            }

            user_history_item(
                ensure_non_empty(&text),
                if tool_results.is_empty() {
                    None
                } else {
                    Some(tool_results)
                },
            )
        }
    }
}

fn tool_result_item(block: &AnthropicContentBlock) -> QToolResultItem {
    let mut content = Vec::new();

    match &block.content {
        Value::String(text) => content.push(QToolResultContent {
            text: ensure_non_empty(text),
            json: None,
        }),
        Value::Array(items) => {
            for item in items {
                if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                    content.push(QToolResultContent {
                        text: ensure_non_empty(text),
                        json: None,
                    });
                }
            }
        }
        _ => {}
    }

    QToolResultItem {
        tool_use_id: block.tool_use_id.clone(),
        content,
        status: "success".to_string(),
    }
}
