// Anthropic-facing re-emitters
//
// The streaming side is a small state machine: one open text block, one open
// thinking block, and a map of open tool blocks keyed by tool-use id, all
// sharing a single monotonically increasing block index. Every delta becomes
// a bounded burst of typed SSE events. The non-streaming side tokenises the
// aggregated text back into blocks with the same rules.

use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::time::{interval_at, Duration, Instant};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::anthropic::AnthropicResponseBlock;
use crate::models::openai::ResponseToolCall;
use crate::tokenizer::count_tokens;

use super::decoder::{delta_stream, Delta};

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

/// Interval between keepalive pings while awaiting upstream frames
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Formats one Anthropic SSE event
pub fn format_sse_event(event_type: &str, data: &Value) -> String {
    format!(
        "event: {}\ndata: {}\n\n",
        event_type,
        serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string())
    )
}

// ==================================================================================================
// Block State Machine
// ==================================================================================================

#[derive(Debug, Default)]
pub struct BlockState {
    next_index: i32,
    active_text: Option<i32>,
    active_thinking: Option<i32>,
    tool_blocks: HashMap<String, i32>,
    tool_order: Vec<String>,
    pub has_tool_use: bool,
    text_buf: String,
    thinking_buf: String,
    tool_input_bufs: HashMap<String, String>,
}

impl BlockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one delta, appending the SSE events it produces
    pub fn on_delta(&mut self, delta: &Delta, out: &mut Vec<String>) {
        match delta {
            Delta::Text(text) => {
                self.close_thinking(out);
                if self.active_text.is_none() {
                    let index = self.bump_index();
                    self.active_text = Some(index);
                    out.push(format_sse_event(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {"type": "text", "text": ""},
                        }),
                    ));
                }
                self.text_buf.push_str(text);
                out.push(format_sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.active_text.unwrap(),
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
            Delta::Thinking(text) => {
                self.close_text(out);
                if self.active_thinking.is_none() {
                    let index = self.bump_index();
                    self.active_thinking = Some(index);
                    out.push(format_sse_event(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {"type": "thinking", "thinking": ""},
                        }),
                    ));
                }
                self.thinking_buf.push_str(text);
                out.push(format_sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.active_thinking.unwrap(),
                        "delta": {"type": "thinking_delta", "thinking": text},
                    }),
                ));
            }
            Delta::ToolUseStart { id, name } => {
                self.close_text(out);
                self.close_thinking(out);
                self.has_tool_use = true;

                let index = self.bump_index();
                self.tool_blocks.insert(id.clone(), index);
                self.tool_order.push(id.clone());
                self.tool_input_bufs.insert(id.clone(), String::new());

                let name = if name.is_empty() { id } else { name };
                out.push(format_sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": {},
                        },
                    }),
                ));
            }
            Delta::ToolUseArgFragment { id, fragment } => {
                if let Some(&index) = self.tool_blocks.get(id) {
                    if let Some(buf) = self.tool_input_bufs.get_mut(id) {
                        buf.push_str(fragment);
                    }
                    out.push(format_sse_event(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "input_json_delta", "partial_json": fragment},
                        }),
                    ));
                }
            }
            Delta::ToolUseStop { id } => self.close_tool(id, out),
            // Abort terminates the whole message; the caller owns that.
            Delta::Abort { .. } => {}
        }
    }

    /// Closes every block that is still open, in open-order for tools
    pub fn close_all(&mut self, out: &mut Vec<String>) {
        self.close_text(out);
        self.close_thinking(out);
        for id in self.tool_order.clone() {
            self.close_tool(&id, out);
        }
    }

    /// Cumulative output used for the final token estimate
    pub fn output_text(&self) -> String {
        let mut text = String::new();
        text.push_str(&self.text_buf);
        text.push_str(&self.thinking_buf);
        for id in &self.tool_order {
            if let Some(buf) = self.tool_input_bufs.get(id) {
                text.push_str(buf);
            }
        }
        text
    }

    fn bump_index(&mut self) -> i32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn close_text(&mut self, out: &mut Vec<String>) {
        if let Some(index) = self.active_text.take() {
            out.push(block_stop(index));
        }
    }

    fn close_thinking(&mut self, out: &mut Vec<String>) {
        if let Some(index) = self.active_thinking.take() {
            out.push(block_stop(index));
        }
    }

    fn close_tool(&mut self, id: &str, out: &mut Vec<String>) {
        if let Some(index) = self.tool_blocks.remove(id) {
            out.push(block_stop(index));
        }
    }
}

fn block_stop(index: i32) -> String {
    format_sse_event(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": index}),
    )
}

fn message_delta(stop_reason: &str, output_tokens: i32) -> String {
    format_sse_event(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {"output_tokens": output_tokens},
        }),
    )
}

fn message_stop() -> String {
    format_sse_event("message_stop", &json!({"type": "message_stop"}))
}

fn ping() -> String {
    format_sse_event("ping", &json!({"type": "ping"}))
}

pub fn message_start(message_id: &str, model: &str, input_tokens: i32) -> String {
    format_sse_event(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": input_tokens, "output_tokens": 1},
            },
        }),
    )
}

// ==================================================================================================
// SSE Streaming
// ==================================================================================================

/// Converts the upstream reply into Anthropic typed SSE events.
///
/// A keepalive ping goes out every five seconds while the upstream is quiet.
/// If the client goes away the returned stream is simply dropped, which
/// cancels the upstream read.
pub fn stream_anthropic_sse(
    response: reqwest::Response,
    model: String,
    input_tokens: i32,
) -> impl Stream<Item = Result<String, ApiError>> {
    async_stream::stream! {
        let message_id = format!("msg-{}", Uuid::new_v4());
        yield Ok(message_start(&message_id, &model, input_tokens));
        yield Ok(ping());

        let mut state = BlockState::new();
        let mut deltas = std::pin::pin!(delta_stream(response, true));
        let mut keepalive = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    yield Ok(ping());
                }
                next = deltas.next() => {
                    match next {
                        None => break,
                        Some(Err(e)) => {
                            // Mid-stream decode failure: best-effort close and drop
                            tracing::error!("upstream stream error: {}", e);
                            yield Err(e);
                            return;
                        }
                        Some(Ok(Delta::Abort { reason, message })) => {
                            tracing::warn!("upstream abort: {} - {}", reason, message);
                            let mut out = Vec::new();
                            state.close_all(&mut out);
                            out.push(message_delta("error", count_tokens(&state.output_text())));
                            out.push(message_stop());
                            for event in out {
                                yield Ok(event);
                            }
                            return;
                        }
                        Some(Ok(delta)) => {
                            let mut out = Vec::new();
                            state.on_delta(&delta, &mut out);
                            for event in out {
                                yield Ok(event);
                            }
                        }
                    }
                }
            }
        }

        let mut out = Vec::new();
        state.close_all(&mut out);
        let stop_reason = if state.has_tool_use { "tool_use" } else { "end_turn" };
        out.push(message_delta(stop_reason, count_tokens(&state.output_text())));
        out.push(message_stop());
        for event in out {
            yield Ok(event);
        }
    }
}

// ==================================================================================================
// Aggregated Blocks
// ==================================================================================================

/// Tokenises aggregated text (with inline thinking tags) plus completed tool
/// calls into an ordered Anthropic content-block list
pub fn content_blocks(content: &str, tool_calls: &[ResponseToolCall]) -> Vec<AnthropicResponseBlock> {
    let mut blocks = Vec::with_capacity(tool_calls.len() + 2);
    let mut rest = content;

    while !rest.is_empty() {
        if let Some(start) = rest.find(THINKING_OPEN) {
            if start > 0 && !rest[..start].trim().is_empty() {
                blocks.push(AnthropicResponseBlock::Text {
                    text: rest[..start].to_string(),
                });
            }
            rest = &rest[start + THINKING_OPEN.len()..];
            if let Some(end) = rest.find(THINKING_CLOSE) {
                blocks.push(AnthropicResponseBlock::Thinking {
                    thinking: rest[..end].to_string(),
                });
                rest = &rest[end + THINKING_CLOSE.len()..];
            } else {
                blocks.push(AnthropicResponseBlock::Thinking {
                    thinking: rest.to_string(),
                });
                break;
            }
        } else {
            if !rest.trim().is_empty() {
                blocks.push(AnthropicResponseBlock::Text {
                    text: rest.to_string(),
                });
            }
            break;
        }
    }

    for tc in tool_calls {
        blocks.push(AnthropicResponseBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.function.name.clone(),
            input: tool_input_value(&tc.function.arguments),
        });
    }

    blocks
}

/// Maps an aggregated arguments string to a tool_use input value
fn tool_input_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => json!({}),
        Ok(decoded) => decoded,
        Err(_) => Value::String(trimmed.to_string()),
    }
}

pub fn stop_reason(tool_calls: &[ResponseToolCall]) -> &'static str {
    if tool_calls.is_empty() {
        "end_turn"
    } else {
        "tool_use"
    }
}
