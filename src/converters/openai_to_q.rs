// OpenAI chat/completions -> Amazon Q conversation state

use uuid::Uuid;

use crate::models::openai::{ChatCompletionRequest, ChatMessage};
use crate::models::q::{
    QApiRequest, QAssistantResponse, QConversationState, QCurrentMessage, QHistoryItem, QImage,
    QImageSource, QToolResultContent, QToolResultItem, QToolUse, QUserInputHistory,
    QUserInputMessage, QUserInputMessageContext,
};

use super::core::{
    build_q_tools, ensure_non_empty, env_state, filler_assistant, filler_user,
    image_format_from_data_url, map_model_name, normalize_alternation, origin,
    strip_base64_header, tool_input_from_arguments, ToolSpecInput, THINKING_SENTINEL,
};

/// Builds the upstream request from an OpenAI chat/completions request.
///
/// System and developer messages become user history items, tool messages
/// attach their result to the most recent user turn, and the history is
/// repaired to alternate strictly before the final user turn is popped into
/// `currentMessage`.
pub fn map_openai_request(
    req: &ChatCompletionRequest,
    conversation_id: &str,
) -> Result<QApiRequest, String> {
    let model_id = map_model_name(&req.model);

    let (q_tools, long_tool_docs) = build_q_tools(
        req.tools
            .iter()
            .map(|tool| ToolSpecInput {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                schema: tool.function.parameters.clone(),
            })
            .collect(),
    );

    let mut history: Vec<QHistoryItem> = Vec::new();
    let mut last_user_index: isize = -1;
    let mut last_assistant_index: isize = -1;

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                history.push(user_history_item(
                    ensure_non_empty(&msg.content.as_text()),
                    Vec::new(),
                ));
                last_user_index = history.len() as isize - 1;
            }
            "user" => {
                let images = extract_images(msg);
                history.push(user_history_item(
                    ensure_non_empty(&msg.content.as_text()),
                    images,
                ));
                last_user_index = history.len() as isize - 1;
            }
            "assistant" => {
                let tool_uses: Vec<QToolUse> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| QToolUse {
                        tool_use_id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        input: tool_input_from_arguments(&tc.function.arguments),
                    })
                    .collect();

                history.push(QHistoryItem::Assistant(QAssistantResponse {
                    message_id: Uuid::new_v4().to_string(),
                    content: ensure_non_empty(&msg.content.as_text()),
                    tool_uses: if tool_uses.is_empty() {
                        None
                    } else {
                        Some(tool_uses)
                    },
                }));
                last_assistant_index = history.len() as isize - 1;
            }
            "tool" => {
                let result = tool_result_from_message(msg);

                if last_user_index > last_assistant_index {
                    attach_tool_result(&mut history, last_user_index as usize, result);
                } else if last_assistant_index > last_user_index {
                    // The previous turn was the assistant's tool call; a blank
                    // user turn has to carry the result to keep alternation.
                    history.push(filler_user());
                    last_user_index = history.len() as isize - 1;
                    attach_tool_result(&mut history, last_user_index as usize, result);
                }
                // A tool message with no prior turns attaches nowhere.
            }
            _ => {}
        }
    }

    if history.is_empty() {
        return Err("no convertible messages in request".to_string());
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

    // The last user turn becomes the current message; a trailing assistant
    // turn stays in history and leaves the current message blank.
    if history.last().is_some_and(|item| item.is_user()) {
        if let Some(QHistoryItem::User(user)) = history.pop() {
            current.content = user.content;
            current.user_input_message_context.tool_results =
                user.user_input_message_context.tool_results;
            current.images = user.images;
        }
    }

    // History must end in an assistant turn before the implicit user turn.
    if history.last().is_some_and(|item| item.is_user()) {
        history.push(filler_assistant());
    }

    if !long_tool_docs.is_empty() {
        current.content = format!("{}{}", long_tool_docs, current.content);
    }
    current.content = ensure_non_empty(&current.content);

    if wants_thinking(req) {
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

fn wants_thinking(req: &ChatCompletionRequest) -> bool {
    req.model.ends_with("-thinking")
        || (!req.reasoning_effort.is_empty() && req.reasoning_effort != "none")
}

fn user_history_item(content: String, images: Vec<QImage>) -> QHistoryItem {
    QHistoryItem::User(QUserInputHistory {
        content,
        user_input_message_context: QUserInputMessageContext {
            env_state: env_state(),
            tool_results: None,
            tools: None,
        },
        origin: origin(),
        images,
    })
}

fn extract_images(msg: &ChatMessage) -> Vec<QImage> {
    msg.content
        .parts()
        .iter()
        .filter(|part| part.part_type == "image_url")
        .filter_map(|part| part.image_url.as_ref())
        .map(|image| QImage {
            format: image_format_from_data_url(&image.url),
            source: QImageSource {
                bytes: strip_base64_header(&image.url).to_string(),
            },
        })
        .collect()
}

fn tool_result_from_message(msg: &ChatMessage) -> QToolResultItem {
    let text = msg.content.as_text();

    // JSON tool output is carried raw; everything else is carried as text.
    let content = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(parsed) => QToolResultContent {
            text: String::new(),
            json: Some(parsed),
        },
        Err(_) => QToolResultContent {
            text: ensure_non_empty(&text),
            json: None,
        },
    };

    QToolResultItem {
        tool_use_id: msg.tool_call_id.clone(),
        content: vec![content],
        status: "success".to_string(),
    }
}

fn attach_tool_result(history: &mut [QHistoryItem], index: usize, result: QToolResultItem) {
    if let Some(QHistoryItem::User(user)) = history.get_mut(index) {
        user.user_input_message_context
            .tool_results
            .get_or_insert_with(Vec::new)
            .push(result);
    }
}
