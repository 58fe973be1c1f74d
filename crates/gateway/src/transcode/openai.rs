//! Anthropic ↔ OpenAI Chat Completions conversion.

use std::collections::BTreeSet;

use crate::messages::{
    anthropic::{
        ContentBlock, ContentDelta, MessageDeltaBody, MessageStart, MessagesRequest, MessagesResponse, Role,
        StopReason, StreamEvent, ToolChoice, Usage,
    },
    openai,
};

/// Convert an Anthropic request into an OpenAI chat completions request.
///
/// The system prompt becomes a leading system message. Assistant tool_use
/// blocks become `tool_calls`; user tool_result blocks become `role: tool`
/// messages, preceded by a user message carrying any text parts.
pub fn chat_request(request: &MessagesRequest) -> openai::ChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        messages.push(openai::ChatMessage::text(openai::ChatRole::System, system.flatten()));
    }

    for message in &request.messages {
        match message.role {
            Role::Assistant => push_assistant(&mut messages, message.content.blocks()),
            Role::User => push_user(&mut messages, message.content.blocks()),
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| openai::Tool {
                tool_type: "function".to_string(),
                function: openai::FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect()
    });

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => openai::ToolChoice::Mode("auto".to_string()),
        ToolChoice::Any => openai::ToolChoice::Mode("required".to_string()),
        ToolChoice::Tool { name } => openai::ToolChoice::Specific {
            choice_type: "function".to_string(),
            function: openai::FunctionChoice { name: name.clone() },
        },
    });

    openai::ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        stream: request.stream,
        tools,
        tool_choice,
    }
}

fn push_assistant(messages: &mut Vec<openai::ChatMessage>, blocks: Vec<ContentBlock>) {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(openai::ToolCall {
                id,
                call_type: "function".to_string(),
                function: openai::FunctionCall {
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                },
            }),
            // Thinking has no OpenAI counterpart and local models do not
            // consume it.
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            other => {
                log::debug!("Skipping assistant block without OpenAI equivalent: {other:?}");
            }
        }
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join(""))
    };

    messages.push(openai::ChatMessage {
        role: openai::ChatRole::Assistant,
        content,
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id: None,
    });
}

fn push_user(messages: &mut Vec<openai::ChatMessage>, blocks: Vec<ContentBlock>) {
    let has_tool_results = blocks
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolResult { .. }));

    if !has_tool_results {
        let text = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        messages.push(openai::ChatMessage::text(openai::ChatRole::User, text));
        return;
    }

    let text_parts: Vec<&str> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();

    if !text_parts.is_empty() {
        messages.push(openai::ChatMessage::text(openai::ChatRole::User, text_parts.join("")));
    }

    for block in blocks {
        let ContentBlock::ToolResult {
            tool_use_id, content, ..
        } = block
        else {
            continue;
        };

        messages.push(openai::ChatMessage {
            role: openai::ChatRole::Tool,
            content: Some(content.map(|c| c.flatten()).unwrap_or_default()),
            tool_calls: None,
            tool_call_id: Some(tool_use_id),
        });
    }
}

/// Wrap a non-streaming OpenAI response into an Anthropic message with
/// `end_turn` and zeroed usage.
pub fn response_to_message(response: openai::ChatResponse, model: &str) -> MessagesResponse {
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;

    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(text) = choice.message.content
            && !text.is_empty()
        {
            content.push(ContentBlock::Text { text });
        }

        for call in choice.message.tool_calls.unwrap_or_default() {
            let input = serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            stop_reason = StopReason::ToolUse;
        }
    }

    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: Usage::default(),
    }
}

/// Stateful adapter turning OpenAI stream chunks into Anthropic events.
///
/// Emits a synthetic `message_start` before the first delta; the caller
/// drives `finish` when the upstream stream terminates. Text deltas land at
/// block index 0, tool calls at their `tool_calls[].index`.
pub struct StreamAdapter {
    model: String,
    started: bool,
    text_open: bool,
    open_tools: BTreeSet<usize>,
    stop_reason: Option<StopReason>,
}

impl StreamAdapter {
    /// New adapter for a stream produced by `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            started: false,
            text_open: false,
            open_tools: BTreeSet::new(),
            stop_reason: None,
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

    /// Map one upstream chunk onto zero or more Anthropic events.
    pub fn process(&mut self, chunk: openai::ChatChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(text) = choice.delta.content
            && !text.is_empty()
        {
            if !self.text_open {
                self.text_open = true;
                events.push(StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::Text { text: String::new() },
                });
            }

            events.push(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta { text },
            });
        }

        for call in choice.delta.tool_calls.unwrap_or_default() {
            let index = call.index;

            if let Some(id) = call.id {
                let name = call
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone())
                    .unwrap_or_default();

                self.open_tools.insert(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                });
            }

            if let Some(arguments) = call.function.and_then(|f| f.arguments)
                && !arguments.is_empty()
            {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: arguments,
                    },
                });
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.stop_reason = Some(match reason.as_str() {
                "length" => StopReason::MaxTokens,
                "tool_calls" => StopReason::ToolUse,
                _ => StopReason::EndTurn,
            });
        }

        events
    }

    /// Close open blocks and frame `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if self.text_open {
            self.text_open = false;
            events.push(StreamEvent::ContentBlockStop { index: 0 });
        }

        for index in std::mem::take(&mut self.open_tools) {
            events.push(StreamEvent::ContentBlockStop { index });
        }

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.stop_reason.take().unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: Some(Usage::default()),
        });
        events.push(StreamEvent::MessageStop);

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::anthropic::{Message, MessageContent, SystemPrompt, Tool, ToolResultContent};
    use serde_json::json;

    fn request_with(messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: "local-gemma".to_string(),
            messages,
            max_tokens: 128,
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
    fn system_prompt_becomes_leading_system_message() {
        let mut request = request_with(vec![Message {
            role: Role::User,
            content: MessageContent::Text("hi".to_string()),
        }]);
        request.system = Some(SystemPrompt::Text("Be terse.".to_string()));

        let chat = chat_request(&request);

        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, openai::ChatRole::System);
        assert_eq!(chat.messages[0].content.as_deref(), Some("Be terse."));
        assert_eq!(chat.messages[1].role, openai::ChatRole::User);
    }

    #[test]
    fn assistant_tool_use_becomes_tool_calls() {
        let request = request_with(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "Checking.".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_01".to_string(),
                    name: "get_weather".to_string(),
                    input: json!({"location": "Paris"}),
                },
            ]),
        }]);

        let chat = chat_request(&request);
        let message = &chat.messages[0];

        assert_eq!(message.content.as_deref(), Some("Checking."));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_01");
        assert_eq!(calls[0].function.name, "get_weather");

        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["location"], "Paris");
    }

    #[test]
    fn tool_results_become_tool_messages_after_text() {
        let request = request_with(vec![Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "Here you go.".to_string(),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "toolu_01".to_string(),
                    content: Some(ToolResultContent::Text("18C".to_string())),
                    is_error: None,
                },
                ContentBlock::ToolResult {
                    tool_use_id: "toolu_02".to_string(),
                    content: Some(ToolResultContent::Blocks(vec![ContentBlock::Text {
                        text: "sunny".to_string(),
                    }])),
                    is_error: None,
                },
            ]),
        }]);

        let chat = chat_request(&request);

        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.messages[0].role, openai::ChatRole::User);
        assert_eq!(chat.messages[0].content.as_deref(), Some("Here you go."));

        assert_eq!(chat.messages[1].role, openai::ChatRole::Tool);
        assert_eq!(chat.messages[1].tool_call_id.as_deref(), Some("toolu_01"));
        assert_eq!(chat.messages[1].content.as_deref(), Some("18C"));

        assert_eq!(chat.messages[2].tool_call_id.as_deref(), Some("toolu_02"));
        assert_eq!(chat.messages[2].content.as_deref(), Some("sunny"));
    }

    #[test]
    fn tool_choice_maps_all_modes() {
        let mut request = request_with(vec![Message {
            role: Role::User,
            content: MessageContent::Text("x".to_string()),
        }]);
        request.tools = Some(vec![Tool {
            name: "t".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }]);

        request.tool_choice = Some(ToolChoice::Auto);
        assert!(matches!(
            chat_request(&request).tool_choice,
            Some(openai::ToolChoice::Mode(ref m)) if m == "auto"
        ));

        request.tool_choice = Some(ToolChoice::Any);
        assert!(matches!(
            chat_request(&request).tool_choice,
            Some(openai::ToolChoice::Mode(ref m)) if m == "required"
        ));

        request.tool_choice = Some(ToolChoice::Tool { name: "t".to_string() });
        assert!(matches!(
            chat_request(&request).tool_choice,
            Some(openai::ToolChoice::Specific { .. })
        ));
    }

    #[test]
    fn text_round_trip_preserves_roles_and_text() {
        let request = request_with(vec![
            Message {
                role: Role::User,
                content: MessageContent::Text("first".to_string()),
            },
            Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::Text {
                    text: "second".to_string(),
                }]),
            },
        ]);

        let chat = chat_request(&request);

        assert_eq!(chat.messages[0].role, openai::ChatRole::User);
        assert_eq!(chat.messages[0].content.as_deref(), Some("first"));
        assert_eq!(chat.messages[1].role, openai::ChatRole::Assistant);
        assert_eq!(chat.messages[1].content.as_deref(), Some("second"));
    }

    #[test]
    fn stream_adapter_frames_text_stream() {
        let mut adapter = StreamAdapter::new("local-gemma");

        let chunk: openai::ChatChunk = serde_json::from_value(json!({
            "choices": [{ "index": 0, "delta": { "content": "ok" } }]
        }))
        .unwrap();

        let mut events = adapter.process(chunk);
        events.extend(adapter.finish());

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(
            names,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );

        let StreamEvent::ContentBlockDelta {
            delta: ContentDelta::TextDelta { text },
            ..
        } = &events[2]
        else {
            unreachable!("expected text delta");
        };
        assert_eq!(text, "ok");
    }

    #[test]
    fn stream_adapter_concatenates_tool_arguments() {
        let mut adapter = StreamAdapter::new("local-gemma");

        let start: openai::ChatChunk = serde_json::from_value(json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0, "id": "call_1",
                "function": { "name": "get_weather", "arguments": "" }
            }]}}]
        }))
        .unwrap();

        let frag1: openai::ChatChunk = serde_json::from_value(json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0, "function": { "arguments": "{\"location\":" }
            }]}}]
        }))
        .unwrap();

        let frag2: openai::ChatChunk = serde_json::from_value(json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0, "function": { "arguments": "\"Paris\"}" }
            }]}}]
        }))
        .unwrap();

        let mut events = adapter.process(start);
        events.extend(adapter.process(frag1));
        events.extend(adapter.process(frag2));
        events.extend(adapter.finish());

        let fragments: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();

        let parsed: serde_json::Value = serde_json::from_str(&fragments).unwrap();
        assert_eq!(parsed["location"], "Paris");
    }

    #[test]
    fn empty_choices_only_frame_message_start() {
        let mut adapter = StreamAdapter::new("local-gemma");

        let chunk: openai::ChatChunk = serde_json::from_value(json!({ "choices": [] })).unwrap();
        let events = adapter.process(chunk);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "message_start");
    }
}
