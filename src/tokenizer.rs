// Token estimation
//
// Approximate counting over cl100k_base. Thinking markers are stripped first
// so reasoning traffic does not inflate the numbers. Exact parity with either
// vendor's tokenizer is not a goal.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

use crate::models::anthropic::{AnthropicContent, AnthropicRequest};

static ENCODING: OnceLock<CoreBPE> = OnceLock::new();

fn encoding() -> &'static CoreBPE {
    ENCODING.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to initialize cl100k_base encoding")
    })
}

/// Counts approximate tokens in a piece of text
pub fn count_tokens(text: &str) -> i32 {
    if text.is_empty() {
        return 0;
    }
    let text = text.replace("<thinking>", "").replace("</thinking>", "");
    encoding().encode_with_special_tokens(&text).len() as i32
}

/// Estimates the input token count of an Anthropic request: system prompt,
/// message content (tool uses and results included), and tool definitions
pub fn estimate_input_tokens(req: &AnthropicRequest) -> i32 {
    let mut parts: Vec<String> = Vec::new();
    parts.push(req.system.as_text());

    for msg in &req.messages {
        match &msg.content {
            AnthropicContent::Text(text) => parts.push(text.clone()),
            AnthropicContent::Blocks(blocks) => {
                for block in blocks {
                    parts.push(block.text.clone());
                    match block.block_type.as_str() {
                        "tool_use" => {
                            parts.push(block.name.clone());
                            if let Ok(input) = serde_json::to_string(&block.input) {
                                parts.push(input);
                            }
                        }
                        "tool_result" => parts.push(block.content_text()),
                        _ => {}
                    }
                }
            }
        }
    }

    for tool in &req.tools {
        parts.push(tool.name.clone());
        parts.push(tool.description.clone());
        if let Ok(schema) = serde_json::to_string(&tool.input_schema) {
            parts.push(schema);
        }
    }

    count_tokens(&parts.join("\n"))
}
