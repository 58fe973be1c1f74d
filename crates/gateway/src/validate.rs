//! Request validation: object-safety scanning of the raw body, schema
//! checks, and defaulting. Validation runs for every route, including the
//! local gateway.

use serde_json::Value;

use crate::{
    error::{GatewayError, GatewayResult},
    messages::anthropic::{ContentBlock, MessagesRequest},
};

const MAX_DEPTH: usize = 50;
const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

const MAX_MESSAGES: usize = 500;
const MAX_TOOLS: usize = 100;
const MAX_TEXT_BYTES: usize = 2 * 1024 * 1024;
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const MAX_MAX_TOKENS: u32 = 200_000;
const MAX_TOKENS_CAP: u32 = 8192;
const MIN_THINKING_BUDGET: u32 = 1000;
const MAX_THINKING_BUDGET: u32 = 100_000;

const ALLOWED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Reject bodies carrying prototype-pollution keys or pathological nesting
/// before any typed decoding happens. Values are trees, so this scan doubles
/// as the general object-safety guard.
pub fn scan_object_safety(value: &Value) -> GatewayResult<()> {
    scan_value(value, 0)
}

fn scan_value(value: &Value, depth: usize) -> GatewayResult<()> {
    if depth > MAX_DEPTH {
        return Err(GatewayError::InvalidRequest(format!(
            "Request nesting depth exceeds {MAX_DEPTH}"
        )));
    }

    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    return Err(GatewayError::InvalidRequest(
                        "Prototype pollution attempt detected".to_string(),
                    ));
                }
                scan_value(nested, depth + 1)?;
            }
        }
        Value::Array(values) => {
            for nested in values {
                scan_value(nested, depth + 1)?;
            }
        }
        _ => {}
    }

    Ok(())
}

/// Validate a decoded request and apply defaults: `stream` becomes `false`
/// when absent, `max_tokens` is clamped to 8192.
pub fn validate(request: &mut MessagesRequest) -> GatewayResult<()> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must contain at least one entry".to_string(),
        ));
    }

    if request.messages.len() > MAX_MESSAGES {
        return Err(GatewayError::InvalidRequest(format!(
            "messages cannot contain more than {MAX_MESSAGES} entries"
        )));
    }

    for message in &request.messages {
        for block in message.content.blocks() {
            validate_block(&block)?;
        }
    }

    if request.max_tokens == 0 || request.max_tokens > MAX_MAX_TOKENS {
        return Err(GatewayError::InvalidRequest(format!(
            "max_tokens must be between 1 and {MAX_MAX_TOKENS}"
        )));
    }

    if let Some(temperature) = request.temperature
        && !(0.0..=2.0).contains(&temperature)
    {
        return Err(GatewayError::InvalidRequest(
            "temperature must be between 0 and 2".to_string(),
        ));
    }

    if let Some(top_p) = request.top_p
        && !(0.0..=1.0).contains(&top_p)
    {
        return Err(GatewayError::InvalidRequest(
            "top_p must be between 0 and 1".to_string(),
        ));
    }

    if let Some(top_k) = request.top_k
        && !(1..=500).contains(&top_k)
    {
        return Err(GatewayError::InvalidRequest(
            "top_k must be between 1 and 500".to_string(),
        ));
    }

    if let Some(tools) = &request.tools {
        if tools.len() > MAX_TOOLS {
            return Err(GatewayError::InvalidRequest(format!(
                "tools cannot contain more than {MAX_TOOLS} entries"
            )));
        }

        for tool in tools {
            validate_tool_name(&tool.name)?;
        }
    }

    if let Some(thinking) = &request.thinking
        && !(MIN_THINKING_BUDGET..=MAX_THINKING_BUDGET).contains(&thinking.budget_tokens)
    {
        return Err(GatewayError::InvalidRequest(format!(
            "thinking.budget_tokens must be between {MIN_THINKING_BUDGET} and {MAX_THINKING_BUDGET}"
        )));
    }

    // Defaults.
    if request.stream.is_none() {
        request.stream = Some(false);
    }
    request.max_tokens = request.max_tokens.min(MAX_TOKENS_CAP);

    Ok(())
}

fn validate_block(block: &ContentBlock) -> GatewayResult<()> {
    match block {
        ContentBlock::Text { text } => {
            if text.len() > MAX_TEXT_BYTES {
                return Err(GatewayError::InvalidRequest(
                    "text block exceeds the 2 MB limit".to_string(),
                ));
            }
        }
        ContentBlock::Image { source } => {
            if !ALLOWED_IMAGE_TYPES.contains(&source.media_type.as_str()) {
                return Err(GatewayError::InvalidRequest(format!(
                    "unsupported image media_type '{}'",
                    source.media_type
                )));
            }

            if source.data.len() > MAX_IMAGE_BYTES {
                return Err(GatewayError::InvalidRequest(
                    "image block exceeds the 10 MB limit".to_string(),
                ));
            }
        }
        ContentBlock::ToolUse { name, .. } => validate_tool_name(name)?,
        ContentBlock::ToolResult { content, .. } => {
            if let Some(crate::messages::anthropic::ToolResultContent::Blocks(blocks)) = content {
                for nested in blocks {
                    validate_block(nested)?;
                }
            }
        }
        // Thinking payloads and unknown block types are forwarded opaquely.
        _ => {}
    }

    Ok(())
}

fn validate_tool_name(name: &str) -> GatewayResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 256
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest(format!(
            "tool name '{name}' must match [A-Za-z0-9_-] and be at most 256 characters"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::anthropic::{ImageSource, Message, MessageContent, Role, ThinkingConfig, Tool};
    use serde_json::json;

    fn minimal_request() -> MessagesRequest {
        MessagesRequest {
            model: "claude-3-5-sonnet".to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            max_tokens: 100_000,
            system: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
        }
    }

    #[test]
    fn pollution_key_at_top_level_is_rejected() {
        let body = json!({ "model": "claude-3", "__proto__": { "polluted": true } });

        let error = scan_object_safety(&body).unwrap_err();
        assert_eq!(error.client_message(), "Prototype pollution attempt detected");
    }

    #[test]
    fn pollution_key_nested_is_rejected() {
        let body = json!({
            "messages": [{ "content": [{ "input": { "constructor": {} } }] }]
        });

        assert!(scan_object_safety(&body).is_err());
    }

    #[test]
    fn depth_fifty_one_is_rejected() {
        let mut value = json!("leaf");
        for _ in 0..51 {
            value = json!({ "nest": value });
        }

        let error = scan_object_safety(&value).unwrap_err();
        assert!(error.client_message().contains("depth"));
    }

    #[test]
    fn depth_under_limit_is_accepted() {
        let mut value = json!("leaf");
        for _ in 0..40 {
            value = json!({ "nest": value });
        }

        assert!(scan_object_safety(&value).is_ok());
    }

    #[test]
    fn defaults_are_applied() {
        let mut request = minimal_request();
        validate(&mut request).unwrap();

        assert_eq!(request.stream, Some(false));
        assert_eq!(request.max_tokens, 8192);
    }

    #[test]
    fn max_tokens_bounds() {
        let mut request = minimal_request();
        request.max_tokens = 0;
        assert!(validate(&mut request).is_err());

        let mut request = minimal_request();
        request.max_tokens = 10_000_000;
        assert!(validate(&mut request).is_err());

        let mut request = minimal_request();
        request.max_tokens = 4000;
        validate(&mut request).unwrap();
        assert_eq!(request.max_tokens, 4000);
    }

    #[test]
    fn bmp_image_is_rejected() {
        let mut request = minimal_request();
        request.messages[0].content = MessageContent::Blocks(vec![ContentBlock::Image {
            source: ImageSource {
                source_type: "base64".to_string(),
                media_type: "image/bmp".to_string(),
                data: "AAAA".to_string(),
            },
        }]);

        let error = validate(&mut request).unwrap_err();
        assert!(error.client_message().contains("image/bmp"));
    }

    #[test]
    fn bad_tool_name_is_rejected() {
        let mut request = minimal_request();
        request.tools = Some(vec![Tool {
            name: "bad name!".to_string(),
            description: None,
            input_schema: json!({}),
        }]);

        assert!(validate(&mut request).is_err());
    }

    #[test]
    fn too_many_messages_is_rejected() {
        let mut request = minimal_request();
        request.messages = (0..501)
            .map(|_| Message {
                role: Role::User,
                content: MessageContent::Text("x".to_string()),
            })
            .collect();

        assert!(validate(&mut request).is_err());
    }

    #[test]
    fn thinking_budget_bounds() {
        let mut request = minimal_request();
        request.thinking = Some(ThinkingConfig {
            mode: Some("enabled".to_string()),
            budget_tokens: 999,
        });
        assert!(validate(&mut request).is_err());

        let mut request = minimal_request();
        request.thinking = Some(ThinkingConfig {
            mode: Some("enabled".to_string()),
            budget_tokens: 4096,
        });
        assert!(validate(&mut request).is_ok());
    }

    #[test]
    fn sampling_parameter_bounds() {
        let mut request = minimal_request();
        request.temperature = Some(2.5);
        assert!(validate(&mut request).is_err());

        let mut request = minimal_request();
        request.top_p = Some(1.5);
        assert!(validate(&mut request).is_err());

        let mut request = minimal_request();
        request.top_k = Some(0);
        assert!(validate(&mut request).is_err());
    }
}
