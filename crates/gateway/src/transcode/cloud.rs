//! Anthropic ↔ Cloud-Code proto-JSON conversion.
//!
//! Thinking blocks and their signatures are opaque vendor state; they must
//! survive both directions byte-exact or follow-up turns are rejected
//! cross-model.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::messages::{
    anthropic::{
        ContentBlock, ContentDelta, MessageDeltaBody, MessageStart, MessagesRequest, MessagesResponse, Role,
        StopReason, StreamEvent, ToolChoice, Usage,
    },
    cloud_code::{
        Blob, Candidate, Content, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
        GenerateBody, GenerateChunk, GenerateRequest, GenerateResponse, GenerationConfig, Part, ThinkingConfig,
        ToolConfig, ToolDecl,
    },
};

/// Build the vendor envelope for one request.
pub fn generate_request(request: &MessagesRequest, project: Option<&str>) -> GenerateRequest {
    // tool_result blocks only carry the tool_use id; the vendor wants the
    // function name back, so map ids to names from the preceding tool_use.
    let mut call_names: HashMap<String, String> = HashMap::new();
    for message in &request.messages {
        for block in message.content.blocks() {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                call_names.insert(id, name);
            }
        }
    }

    let contents = request
        .messages
        .iter()
        .map(|message| Content {
            role: Some(match message.role {
                Role::User => "user".to_string(),
                Role::Assistant => "model".to_string(),
            }),
            parts: blocks_to_parts(message.content.blocks(), &call_names),
        })
        .collect();

    let system_instruction = request.system.as_ref().map(|system| Content {
        role: None,
        parts: vec![Part::text(system.flatten())],
    });

    let tools = request.tools.as_ref().map(|tools| {
        vec![ToolDecl {
            function_declarations: tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(scrub_schema(tool.input_schema.clone())),
                })
                .collect(),
        }]
    });

    let tool_config = request.tool_choice.as_ref().map(|choice| {
        let (mode, allowed) = match choice {
            ToolChoice::Auto => ("AUTO", None),
            ToolChoice::Any => ("ANY", None),
            ToolChoice::Tool { name } => ("ANY", Some(vec![name.clone()])),
        };

        ToolConfig {
            function_calling_config: FunctionCallingConfig {
                mode: mode.to_string(),
                allowed_function_names: allowed,
            },
        }
    });

    let thinking_config = request.thinking.as_ref().map(|thinking| ThinkingConfig {
        include_thoughts: true,
        thinking_budget: Some(thinking.budget_tokens),
    });

    GenerateRequest {
        model: request.model.clone(),
        project: project.map(str::to_string),
        request: GenerateBody {
            contents,
            system_instruction,
            tools,
            tool_config,
            generation_config: Some(GenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
                max_output_tokens: Some(request.max_tokens),
                stop_sequences: request.stop_sequences.clone(),
                thinking_config,
            }),
        },
    }
}

fn blocks_to_parts(blocks: Vec<ContentBlock>, call_names: &HashMap<String, String>) -> Vec<Part> {
    let mut parts = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(Part::text(text)),
            ContentBlock::Image { source } => parts.push(Part {
                inline_data: Some(Blob {
                    mime_type: source.media_type,
                    data: source.data,
                }),
                ..Default::default()
            }),
            ContentBlock::ToolUse { id, name, input } => parts.push(Part {
                function_call: Some(FunctionCall {
                    id: Some(id),
                    name,
                    args: input,
                }),
                ..Default::default()
            }),
            ContentBlock::ToolResult {
                tool_use_id, content, ..
            } => {
                let name = call_names.get(&tool_use_id).cloned().unwrap_or_default();
                let result = content.map(|c| c.flatten()).unwrap_or_default();

                parts.push(Part {
                    function_response: Some(FunctionResponse {
                        id: Some(tool_use_id),
                        name,
                        response: json!({ "result": result }),
                    }),
                    ..Default::default()
                });
            }
            ContentBlock::Thinking { thinking, signature } => parts.push(Part {
                text: Some(thinking),
                thought: Some(true),
                thought_signature: signature,
                ..Default::default()
            }),
            ContentBlock::RedactedThinking { data } => parts.push(Part {
                text: Some(String::new()),
                thought: Some(true),
                thought_signature: Some(data),
                ..Default::default()
            }),
            ContentBlock::Unknown(value) => {
                log::debug!("Dropping content block without Cloud-Code equivalent: {value}");
            }
        }
    }

    parts
}

/// Strip schema fields the backend rejects. The backend accepts a narrow
/// JSON Schema subset: no metadata keys, no defaults, and string formats
/// limited to enum and date-time.
pub fn scrub_schema(mut schema: Value) -> Value {
    let mut pending = vec![&mut schema];

    while let Some(node) = pending.pop() {
        let Value::Object(object) = node else {
            continue;
        };

        object.retain(|key, _| !matches!(key.as_str(), "$schema" | "additionalProperties" | "default"));

        let format_rejected = object.get("type").and_then(Value::as_str) == Some("string")
            && object
                .get("format")
                .and_then(Value::as_str)
                .is_some_and(|format| !matches!(format, "enum" | "date-time"));

        if format_rejected {
            object.remove("format");
        }

        for (key, child) in object.iter_mut() {
            match key.as_str() {
                "properties" => {
                    if let Value::Object(nested) = child {
                        pending.extend(nested.values_mut());
                    }
                }
                "items" => pending.push(child),
                _ => {}
            }
        }
    }

    schema
}

fn map_finish_reason(reason: &str, saw_tool_use: bool) -> StopReason {
    match reason {
        "STOP" if saw_tool_use => StopReason::ToolUse,
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "TOOL_USE" => StopReason::ToolUse,
        other => {
            log::warn!("Unknown Cloud-Code finish reason: {other}");
            StopReason::Other(other.to_ascii_lowercase())
        }
    }
}

fn usage_from(metadata: crate::messages::cloud_code::UsageMetadata) -> Usage {
    Usage {
        input_tokens: metadata.prompt_token_count,
        output_tokens: metadata.candidates_token_count + metadata.thoughts_token_count,
    }
}

/// Convert a complete (non-streaming) vendor response into an Anthropic
/// message.
pub fn response_to_message(response: GenerateResponse, model: &str) -> MessagesResponse {
    let mut content = Vec::new();
    let mut saw_tool_use = false;
    let mut finish_reason = None;

    if let Some(Candidate {
        content: candidate_content,
        finish_reason: reason,
        ..
    }) = response.candidates.into_iter().next()
    {
        finish_reason = reason;

        for part in candidate_content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                saw_tool_use = true;
                content.push(ContentBlock::ToolUse {
                    id: call.id.unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple())),
                    name: call.name,
                    input: call.args,
                });
            } else if part.thought == Some(true) {
                content.push(ContentBlock::Thinking {
                    thinking: part.text.unwrap_or_default(),
                    signature: part.thought_signature,
                });
            } else if let Some(text) = part.text {
                content.push(ContentBlock::Text { text });
            }
        }
    }

    let stop_reason = finish_reason
        .as_deref()
        .map(|reason| map_finish_reason(reason, saw_tool_use))
        .or(Some(StopReason::EndTurn));

    MessagesResponse {
        id: response
            .response_id
            .map(|id| format!("msg_{id}"))
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage: response.usage_metadata.map(usage_from).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    Text,
    Thinking,
}

/// Stateful adapter turning vendor SSE chunks into Anthropic events.
///
/// Text and thinking parts stream into open blocks; function calls arrive
/// complete and are framed as start / full input_json_delta / stop.
pub struct StreamAdapter {
    model: String,
    started: bool,
    next_index: usize,
    open: Option<(usize, OpenBlock)>,
    usage: Option<Usage>,
    stop_reason: Option<String>,
    saw_tool_use: bool,
}

impl StreamAdapter {
    /// New adapter for a stream produced by `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            started: false,
            next_index: 0,
            open: None,
            usage: None,
            stop_reason: None,
            saw_tool_use: false,
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: MessageStart::new(&self.model),
            });
        }
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some((index, _)) = self.open.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn open_block(&mut self, kind: OpenBlock, events: &mut Vec<StreamEvent>) -> usize {
        if let Some((index, open_kind)) = self.open
            && open_kind == kind
        {
            return index;
        }

        self.close_open(events);

        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));

        let content_block = match kind {
            OpenBlock::Text => ContentBlock::Text { text: String::new() },
            OpenBlock::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        };

        events.push(StreamEvent::ContentBlockStart { index, content_block });
        index
    }

    /// Map one vendor chunk onto zero or more Anthropic events.
    pub fn process(&mut self, chunk: GenerateChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);

        let Some(response) = chunk.response else {
            // Keep-alive chunk; forwarded so intermediaries keep the
            // connection open.
            events.push(StreamEvent::Ping);
            return events;
        };

        if let Some(metadata) = response.usage_metadata {
            self.usage = Some(usage_from(metadata));
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            return events;
        };

        if let Some(reason) = candidate.finish_reason {
            self.stop_reason = Some(reason);
        }

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                self.saw_tool_use = true;
                self.close_open(&mut events);

                let index = self.next_index;
                self.next_index += 1;

                let id = call
                    .id
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                let input_json = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string());

                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name: call.name,
                        input: json!({}),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: input_json,
                    },
                });
                events.push(StreamEvent::ContentBlockStop { index });
            } else if part.thought == Some(true) {
                let index = self.open_block(OpenBlock::Thinking, &mut events);

                if let Some(text) = part.text
                    && !text.is_empty()
                {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::ThinkingDelta { thinking: text },
                    });
                }

                if let Some(signature) = part.thought_signature {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::SignatureDelta { signature },
                    });
                }
            } else if let Some(text) = part.text {
                if text.is_empty() {
                    continue;
                }

                let index = self.open_block(OpenBlock::Text, &mut events);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::TextDelta { text },
                });
            }
        }

        events
    }

    /// Close open blocks and frame `message_delta` + `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.close_open(&mut events);

        let stop_reason = self
            .stop_reason
            .take()
            .map(|reason| map_finish_reason(&reason, self.saw_tool_use))
            .or(Some(StopReason::EndTurn));

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason,
                stop_sequence: None,
            },
            usage: Some(self.usage.take().unwrap_or_default()),
        });
        events.push(StreamEvent::MessageStop);

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::anthropic::{
        Message, MessageContent, SystemPrompt, ThinkingConfig as AnthropicThinking, Tool, ToolResultContent,
    };
    use serde_json::json;

    fn request_with(messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: "gemini-2.5-pro".to_string(),
            messages,
            max_tokens: 512,
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
    fn thinking_signature_passes_through_request() {
        let request = request_with(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::Thinking {
                thinking: "considering".to_string(),
                signature: Some("sig-bytes-exact".to_string()),
            }]),
        }]);

        let envelope = generate_request(&request, Some("projects/p1"));
        let part = &envelope.request.contents[0].parts[0];

        assert_eq!(part.thought, Some(true));
        assert_eq!(part.thought_signature.as_deref(), Some("sig-bytes-exact"));
        assert_eq!(envelope.project.as_deref(), Some("projects/p1"));
    }

    #[test]
    fn tool_result_resolves_function_name_from_prior_call() {
        let request = request_with(vec![
            Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_9".to_string(),
                    name: "read_file".to_string(),
                    input: json!({"path": "a.txt"}),
                }]),
            },
            Message {
                role: Role::User,
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_9".to_string(),
                    content: Some(ToolResultContent::Text("contents".to_string())),
                    is_error: None,
                }]),
            },
        ]);

        let envelope = generate_request(&request, None);
        let response_part = &envelope.request.contents[1].parts[0];
        let function_response = response_part.function_response.as_ref().unwrap();

        assert_eq!(function_response.name, "read_file");
        assert_eq!(function_response.id.as_deref(), Some("toolu_9"));
        assert_eq!(function_response.response["result"], "contents");
    }

    #[test]
    fn system_and_thinking_config_are_mapped() {
        let mut request = request_with(vec![Message {
            role: Role::User,
            content: MessageContent::Text("q".to_string()),
        }]);
        request.system = Some(SystemPrompt::Text("You are terse.".to_string()));
        request.thinking = Some(AnthropicThinking {
            mode: Some("enabled".to_string()),
            budget_tokens: 2048,
        });

        let envelope = generate_request(&request, None);

        let instruction = envelope.request.system_instruction.unwrap();
        assert_eq!(instruction.parts[0].text.as_deref(), Some("You are terse."));

        let config = envelope.request.generation_config.unwrap();
        assert_eq!(config.thinking_config.unwrap().thinking_budget, Some(2048));
        assert_eq!(config.max_output_tokens, Some(512));
    }

    #[test]
    fn schema_scrubbing_strips_rejected_fields() {
        let mut request = request_with(vec![Message {
            role: Role::User,
            content: MessageContent::Text("q".to_string()),
        }]);
        request.tools = Some(vec![Tool {
            name: "lookup".to_string(),
            description: Some("Find things".to_string()),
            input_schema: json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "id": { "type": "string", "format": "uuid", "default": "x" }
                }
            }),
        }]);

        let envelope = generate_request(&request, None);
        let declaration = &envelope.request.tools.unwrap()[0].function_declarations[0];
        let schema = declaration.parameters.as_ref().unwrap();

        assert!(schema.get("$schema").is_none());
        assert!(schema.get("additionalProperties").is_none());
        assert!(schema["properties"]["id"].get("format").is_none());
        assert!(schema["properties"]["id"].get("default").is_none());
    }

    #[test]
    fn stream_adapter_orders_thinking_text_and_tools() {
        let mut adapter = StreamAdapter::new("gemini-2.5-pro");

        let thinking: GenerateChunk = serde_json::from_value(json!({
            "response": { "candidates": [{ "content": { "parts": [
                { "text": "hmm", "thought": true, "thoughtSignature": "sig1" }
            ]}}]}
        }))
        .unwrap();

        let text: GenerateChunk = serde_json::from_value(json!({
            "response": { "candidates": [{ "content": { "parts": [{ "text": "Answer: " }]}}]}
        }))
        .unwrap();

        let tool: GenerateChunk = serde_json::from_value(json!({
            "response": {
                "candidates": [{
                    "content": { "parts": [
                        { "functionCall": { "id": "toolu_5", "name": "calc", "args": { "x": 1 } } }
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 4, "thoughtsTokenCount": 2 }
            }
        }))
        .unwrap();

        let mut events = adapter.process(thinking);
        events.extend(adapter.process(text));
        events.extend(adapter.process(tool));
        events.extend(adapter.finish());

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(
            names,
            [
                "message_start",
                "content_block_start", // thinking
                "content_block_delta", // thinking delta
                "content_block_delta", // signature delta
                "content_block_stop",
                "content_block_start", // text
                "content_block_delta",
                "content_block_stop",
                "content_block_start", // tool_use
                "content_block_delta", // full input json
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );

        let StreamEvent::ContentBlockDelta {
            delta: ContentDelta::SignatureDelta { signature },
            ..
        } = &events[3]
        else {
            unreachable!("expected signature delta");
        };
        assert_eq!(signature, "sig1");

        let StreamEvent::MessageDelta { delta, usage } = &events[11] else {
            unreachable!("expected message delta");
        };
        assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(usage.unwrap().input_tokens, 10);
        assert_eq!(usage.unwrap().output_tokens, 6);
    }

    #[test]
    fn non_stream_response_preserves_thinking_blocks() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [
                    { "text": "deep thought", "thought": true, "thoughtSignature": "s1" },
                    { "text": "42" }
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 7, "candidatesTokenCount": 3 },
            "responseId": "abc"
        }))
        .unwrap();

        let message = response_to_message(response, "claude-3-5-sonnet");

        assert_eq!(message.content.len(), 2);
        let ContentBlock::Thinking { thinking, signature } = &message.content[0] else {
            unreachable!("expected thinking block");
        };
        assert_eq!(thinking, "deep thought");
        assert_eq!(signature.as_deref(), Some("s1"));
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(message.usage.input_tokens, 7);
    }

    #[test]
    fn keepalive_chunk_becomes_ping() {
        let mut adapter = StreamAdapter::new("gemini-2.5-pro");
        let chunk: GenerateChunk = serde_json::from_value(json!({})).unwrap();

        let events = adapter.process(chunk);
        assert_eq!(events[0].name(), "message_start");
        assert_eq!(events[1].name(), "ping");
    }
}
