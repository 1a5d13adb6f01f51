// Request validation
// Shape and range checks on inbound requests, before any conversion runs

use crate::models::anthropic::AnthropicRequest;
use crate::models::openai::ChatCompletionRequest;

const OPENAI_ROLES: &[&str] = &["system", "developer", "user", "assistant", "tool"];

pub fn validate_chat_completion_request(req: &ChatCompletionRequest) -> Result<(), String> {
    if req.model.is_empty() {
        return Err("model is required".to_string());
    }
    if req.model.len() > 256 {
        return Err("model must be between 1 and 256 characters".to_string());
    }
    if req.messages.is_empty() {
        return Err("messages array cannot be empty".to_string());
    }
    for (i, msg) in req.messages.iter().enumerate() {
        if msg.role.is_empty() {
            return Err(format!("message[{}]: role is required", i));
        }
        if !OPENAI_ROLES.contains(&msg.role.as_str()) {
            return Err(format!("message[{}]: invalid role '{}'", i, msg.role));
        }
    }
    if req.max_tokens < 0 {
        return Err("max_tokens must be non-negative".to_string());
    }
    Ok(())
}

pub fn validate_anthropic_request(req: &AnthropicRequest) -> Result<(), String> {
    if req.model.is_empty() {
        return Err("model is required".to_string());
    }
    if req.model.len() > 256 {
        return Err("model must be between 1 and 256 characters".to_string());
    }
    if req.messages.is_empty() {
        return Err("messages array is required and cannot be empty".to_string());
    }
    if req.max_tokens < 1 {
        return Err("max_tokens is required and must be at least 1".to_string());
    }
    for (i, msg) in req.messages.iter().enumerate() {
        if msg.role.is_empty() {
            return Err(format!("messages[{}]: role is required", i));
        }
        if msg.role != "user" && msg.role != "assistant" {
            return Err(format!(
                "messages[{}]: role must be 'user' or 'assistant'",
                i
            ));
        }
    }
    if let Some(temperature) = req.temperature {
        if !(0.0..=1.0).contains(&temperature) {
            return Err("temperature must be between 0 and 1".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn openai_request(body: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    fn anthropic_request(body: serde_json::Value) -> AnthropicRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_openai_valid_request() {
        let req = openai_request(json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(validate_chat_completion_request(&req).is_ok());
    }

    #[test]
    fn test_openai_missing_model() {
        let req = openai_request(json!({
            "model": "",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(validate_chat_completion_request(&req).is_err());
    }

    #[test]
    fn test_openai_model_too_long() {
        let req = openai_request(json!({
            "model": "m".repeat(257),
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(validate_chat_completion_request(&req).is_err());
    }

    #[test]
    fn test_openai_empty_messages() {
        let req = openai_request(json!({"model": "m", "messages": []}));
        assert!(validate_chat_completion_request(&req).is_err());
    }

    #[test]
    fn test_openai_invalid_role() {
        let req = openai_request(json!({
            "model": "m",
            "messages": [{"role": "narrator", "content": "hi"}]
        }));
        let err = validate_chat_completion_request(&req).unwrap_err();
        assert!(err.contains("invalid role"));
    }

    #[test]
    fn test_openai_developer_role_accepted() {
        let req = openai_request(json!({
            "model": "m",
            "messages": [
                {"role": "developer", "content": "be nice"},
                {"role": "user", "content": "hi"}
            ]
        }));
        assert!(validate_chat_completion_request(&req).is_ok());
    }

    #[test]
    fn test_openai_negative_max_tokens() {
        let req = openai_request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": -1
        }));
        assert!(validate_chat_completion_request(&req).is_err());
    }

    #[test]
    fn test_anthropic_valid_request() {
        let req = anthropic_request(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(validate_anthropic_request(&req).is_ok());
    }

    #[test]
    fn test_anthropic_max_tokens_required() {
        let req = anthropic_request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(validate_anthropic_request(&req).is_err());
    }

    #[test]
    fn test_anthropic_rejects_system_role_in_messages() {
        let req = anthropic_request(json!({
            "model": "m",
            "max_tokens": 1,
            "messages": [{"role": "system", "content": "nope"}]
        }));
        assert!(validate_anthropic_request(&req).is_err());
    }

    #[test]
    fn test_anthropic_temperature_range() {
        let req = anthropic_request(json!({
            "model": "m",
            "max_tokens": 1,
            "temperature": 1.5,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(validate_anthropic_request(&req).is_err());

        let req = anthropic_request(json!({
            "model": "m",
            "max_tokens": 1,
            "temperature": 0.7,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(validate_anthropic_request(&req).is_ok());
    }
}
