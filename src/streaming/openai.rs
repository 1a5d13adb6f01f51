// OpenAI-facing re-emitters
//
// Aggregated collection shared by both non-streaming paths, plus the
// chat.completion.chunk SSE encoder.

use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::openai::{
    ResponseFunctionCall, ResponseToolCall, SseChoice, SseChunk, SseDelta, SseFunctionCall,
    SseToolCall,
};

use super::decoder::{delta_stream, Delta};

// ==================================================================================================
// Aggregated Collection
// ==================================================================================================

/// Everything an upstream reply contained, rolled up
#[derive(Debug, Default)]
pub struct CollectedResponse {
    /// Concatenated text, inline <thinking> tags preserved
    pub content: String,
    pub tool_calls: Vec<ResponseToolCall>,
}

#[derive(Default)]
struct ToolAccumulator {
    order: Vec<String>,
    names: HashMap<String, String>,
    arguments: HashMap<String, String>,
}

impl ToolAccumulator {
    fn start(&mut self, id: String, name: String) {
        if !self.names.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.names.insert(id, name);
    }

    fn append(&mut self, id: &str, fragment: &str) {
        self.arguments.entry(id.to_string()).or_default().push_str(fragment);
    }

    fn into_tool_calls(self) -> Vec<ResponseToolCall> {
        self.order
            .into_iter()
            .enumerate()
            .map(|(index, id)| {
                let name = self.names.get(&id).cloned().unwrap_or_default();
                let raw = self.arguments.get(&id).cloned().unwrap_or_default();
                ResponseToolCall {
                    index: index as i32,
                    id,
                    call_type: "function".to_string(),
                    function: ResponseFunctionCall {
                        name,
                        arguments: normalize_arguments(&raw),
                    },
                }
            })
            .collect()
    }
}

/// Forces accumulated argument fragments into a valid JSON string.
///
/// Empty input becomes `"{}"`; fragments that never formed valid JSON are
/// JSON-string-encoded so the field stays parseable.
pub fn normalize_arguments(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return trimmed.to_string();
    }
    serde_json::to_string(trimmed).unwrap_or_else(|_| "{}".to_string())
}

/// Drains the upstream reply into an aggregated result.
///
/// An upstream abort surfaces as an error; the partial content is dropped.
pub async fn collect_response(
    response: reqwest::Response,
) -> Result<CollectedResponse, ApiError> {
    let mut deltas = std::pin::pin!(delta_stream(response, false));

    let mut content = String::new();
    let mut tools = ToolAccumulator::default();

    while let Some(delta) = deltas.next().await {
        match delta? {
            Delta::Text(text) => content.push_str(&text),
            Delta::Thinking(text) => content.push_str(&text),
            Delta::ToolUseStart { id, name } => tools.start(id, name),
            Delta::ToolUseArgFragment { id, fragment } => tools.append(&id, &fragment),
            Delta::ToolUseStop { .. } => {}
            Delta::Abort { reason, message } => {
                return Err(ApiError::Internal(anyhow::anyhow!(
                    "{}: {}",
                    reason,
                    message
                )));
            }
        }
    }

    Ok(CollectedResponse {
        content,
        tool_calls: tools.into_tool_calls(),
    })
}

// ==================================================================================================
// SSE Streaming
// ==================================================================================================

fn sse_data(chunk: &SseChunk) -> String {
    format!(
        "data: {}\n\n",
        serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string())
    )
}

/// Converts the upstream reply into OpenAI chat.completion.chunk SSE.
///
/// The first chunk carries `delta.role`; text arrives as `delta.content`,
/// thinking as `delta.reasoning_content`, and tool deltas as indexed
/// `tool_calls` entries. The stream ends with a finish_reason chunk and the
/// `[DONE]` sentinel.
pub fn stream_openai_sse(
    response: reqwest::Response,
    model: String,
) -> impl Stream<Item = Result<String, ApiError>> {
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();

    async_stream::stream! {
        let mut deltas = std::pin::pin!(delta_stream(response, true));

        let make_chunk = |delta: SseDelta, finish_reason: Option<String>| SseChunk {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.clone(),
            choices: vec![SseChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };

        yield Ok(sse_data(&make_chunk(
            SseDelta {
                role: "assistant".to_string(),
                ..Default::default()
            },
            None,
        )));

        let mut tool_indices: HashMap<String, i32> = HashMap::new();
        let mut next_tool_index = 0;
        let mut tool_called = false;

        while let Some(delta) = deltas.next().await {
            let delta = match delta {
                Ok(delta) => delta,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            match delta {
                Delta::Text(text) => {
                    yield Ok(sse_data(&make_chunk(
                        SseDelta {
                            content: text,
                            ..Default::default()
                        },
                        None,
                    )));
                }
                Delta::Thinking(text) => {
                    yield Ok(sse_data(&make_chunk(
                        SseDelta {
                            reasoning_content: text,
                            ..Default::default()
                        },
                        None,
                    )));
                }
                Delta::ToolUseStart { id, name } => {
                    tool_called = true;
                    let index = *tool_indices.entry(id.clone()).or_insert_with(|| {
                        let idx = next_tool_index;
                        next_tool_index += 1;
                        idx
                    });
                    yield Ok(sse_data(&make_chunk(
                        SseDelta {
                            tool_calls: vec![SseToolCall {
                                index,
                                function: SseFunctionCall {
                                    name,
                                    ..Default::default()
                                },
                                id,
                                call_type: "function".to_string(),
                            }],
                            ..Default::default()
                        },
                        None,
                    )));
                }
                Delta::ToolUseArgFragment { id, fragment } => {
                    let index = *tool_indices.entry(id.clone()).or_insert_with(|| {
                        let idx = next_tool_index;
                        next_tool_index += 1;
                        idx
                    });
                    yield Ok(sse_data(&make_chunk(
                        SseDelta {
                            tool_calls: vec![SseToolCall {
                                index,
                                function: SseFunctionCall {
                                    arguments: fragment,
                                    ..Default::default()
                                },
                                id,
                                call_type: "function".to_string(),
                            }],
                            ..Default::default()
                        },
                        None,
                    )));
                }
                Delta::ToolUseStop { .. } => {}
                Delta::Abort { reason, message } => {
                    let payload = serde_json::json!({
                        "error": reason,
                        "message": message,
                    });
                    yield Ok(format!("data: {}\n\n", payload));
                    break;
                }
            }
        }

        let finish_reason = if tool_called { "tool_calls" } else { "stop" };
        yield Ok(sse_data(&make_chunk(
            SseDelta::default(),
            Some(finish_reason.to_string()),
        )));
        yield Ok("data: [DONE]\n\n".to_string());
    }
}
