use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the Anthropic Messages API surface the proxy exposes.
///
/// Messages alternate between "user" and "assistant" roles; content is either
/// a bare string or an ordered array of typed blocks. Unknown block types are
/// accepted and forwarded opaquely for forward compatibility with vendor
/// additions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    /// The model to dispatch to. Classified by prefix, see the router.
    pub model: String,

    /// The conversation. Must be non-empty.
    pub messages: Vec<Message>,

    /// Maximum number of tokens to generate. Clamped to 8192 during
    /// validation.
    pub max_tokens: u32,

    /// System prompt, either a string or an array of text blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Controls randomness in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Only sample from the top K tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Sequences that will cause the model to stop generating.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to stream the response as Server-Sent Events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Tools available to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Controls how the model uses tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Extended thinking configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,

    /// Opaque request metadata, forwarded as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// System prompt: a plain string or text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Plain string form.
    Text(String),
    /// Block form; only text blocks are meaningful here.
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Flatten the prompt into a single string.
    pub fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|block| block.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A text block inside the system prompt array form.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    /// Always "text".
    #[serde(rename = "type")]
    pub block_type: String,
    /// The text content.
    pub text: String,
}

/// A conversation message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    /// Who sent the message.
    pub role: Role,
    /// String or block content. Block ordering is preserved end-to-end.
    pub content: MessageContent,
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user input.
    User,
    /// Model output (or replayed history thereof).
    Assistant,
}

/// Message content: a bare string or ordered blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain string content.
    Text(String),
    /// Ordered content blocks.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Iterate the content as blocks, treating a bare string as one text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

/// A content block within a message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },

    /// Base64-encoded image.
    Image {
        /// The image source.
        source: ImageSource,
    },

    /// Tool invocation requested by the assistant.
    ToolUse {
        /// Unique identifier, referenced by a later tool_result.
        id: String,
        /// Tool name.
        name: String,
        /// Input arguments as JSON.
        input: Value,
    },

    /// Result of a tool invocation, sent back by the user.
    ToolResult {
        /// The tool_use id this result answers.
        tool_use_id: String,
        /// Result content; string or nested blocks.
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        /// Whether the tool execution failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Extended-thinking segment. The signature is an opaque vendor token
    /// that must survive round-trips byte-exact.
    Thinking {
        /// The thinking text.
        thinking: String,
        /// Opaque vendor signature.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// Redacted thinking segment; carries only the opaque payload.
    RedactedThinking {
        /// Encrypted thinking payload.
        data: String,
    },

    /// Any block type this proxy does not know about. Forwarded opaquely.
    #[serde(untagged)]
    Unknown(Value),
}

/// Content of a tool_result block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Plain string result.
    Text(String),
    /// Nested block result.
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    /// Flatten the result into a single string, stringifying non-text blocks.
    pub fn flatten(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => text.clone(),
                    other => serde_json::to_string(other).unwrap_or_default(),
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Image source for image content blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    /// The source type, "base64".
    #[serde(rename = "type")]
    pub source_type: String,
    /// Media type, e.g. "image/png".
    pub media_type: String,
    /// Base64-encoded image data.
    pub data: String,
}

/// Tool definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    /// Tool name, `[A-Za-z0-9_-]+`, at most 256 characters.
    pub name: String,
    /// What the tool does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the tool input.
    pub input_schema: Value,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Let the model decide.
    Auto,
    /// Force the model to use some tool.
    Any,
    /// Force the model to use a specific tool.
    Tool {
        /// The tool name.
        name: String,
    },
}

/// Extended thinking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThinkingConfig {
    /// "enabled" or "disabled".
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Token budget for thinking, validated to [1000, 100000].
    pub budget_tokens: u32,
}

/// A complete (non-streaming) Messages API response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesResponse {
    /// Unique message identifier.
    pub id: String,
    /// Always "message".
    #[serde(rename = "type")]
    pub response_type: String,
    /// Always "assistant".
    pub role: String,
    /// Response content blocks.
    pub content: Vec<ContentBlock>,
    /// The model that produced the response.
    pub model: String,
    /// Why generation stopped.
    pub stop_reason: Option<StopReason>,
    /// Which stop sequence was hit, if any.
    pub stop_sequence: Option<String>,
    /// Token accounting.
    pub usage: Usage,
}

/// The reason why the model stopped generating tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural stopping point.
    EndTurn,
    /// Hit the max_tokens limit.
    MaxTokens,
    /// Hit a stop sequence.
    StopSequence,
    /// The model invoked a tool.
    ToolUse,
    /// Any stop reason this proxy does not know about.
    #[serde(untagged)]
    Other(String),
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
    /// Tokens in the input prompt.
    pub input_tokens: u32,
    /// Tokens generated.
    pub output_tokens: u32,
}

/// Streaming event, serialized as one SSE frame each.
///
/// A stream always begins with `message_start` and terminates with
/// `message_stop` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Start of a message.
    MessageStart {
        /// Initial message metadata.
        message: MessageStart,
    },

    /// A content block begins at the given index.
    ContentBlockStart {
        /// Block index within the message.
        index: usize,
        /// The block being started.
        content_block: ContentBlock,
    },

    /// Incremental update to a content block.
    ContentBlockDelta {
        /// Block index within the message.
        index: usize,
        /// The delta payload.
        delta: ContentDelta,
    },

    /// A content block is complete.
    ContentBlockStop {
        /// Block index within the message.
        index: usize,
    },

    /// Final message metadata.
    MessageDelta {
        /// Stop reason and sequence.
        delta: MessageDeltaBody,
        /// Final usage, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// End of stream.
    MessageStop,

    /// Keep-alive.
    Ping,

    /// Terminal error frame.
    Error {
        /// Error details.
        error: ErrorDetails,
    },
}

impl StreamEvent {
    /// SSE `event:` name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Initial message metadata for `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStart {
    /// Unique message identifier.
    pub id: String,
    /// Always "message".
    #[serde(rename = "type")]
    pub message_type: String,
    /// Always "assistant".
    pub role: String,
    /// Initially empty content.
    pub content: Vec<ContentBlock>,
    /// The model producing the stream.
    pub model: String,
    /// Usage known at stream start.
    pub usage: Usage,
}

impl MessageStart {
    /// Fresh message metadata with a generated id and zeroed usage.
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            message_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model: model.to_string(),
            usage: Usage::default(),
        }
    }
}

/// Delta payload for `content_block_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Text appended to a text block.
    TextDelta {
        /// Additional text.
        text: String,
    },
    /// Partial JSON appended to a tool_use block input. Concatenation of all
    /// fragments at a given index parses as the complete input object.
    InputJsonDelta {
        /// Partial JSON string.
        partial_json: String,
    },
    /// Text appended to a thinking block.
    ThinkingDelta {
        /// Additional thinking text.
        thinking: String,
    },
    /// Vendor signature attached to a thinking block.
    SignatureDelta {
        /// Opaque signature.
        signature: String,
    },
}

/// Body of a `message_delta` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    /// Stop reason, when the message is complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Stop sequence, when one was encountered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// Error response body, `{type:"error", error:{type, message}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always "error".
    #[serde(rename = "type")]
    pub response_type: String,
    /// Error details.
    pub error: ErrorDetails,
}

impl ErrorResponse {
    /// Build an error body from a type tag and message.
    pub fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            response_type: "error".to_string(),
            error: ErrorDetails {
                error_type: error_type.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Error details shared by error responses and terminal stream frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error kind.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable message.
    pub message: String,
}

/// Model listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// The model identifier.
    pub id: String,
    /// Always "model".
    #[serde(rename = "type")]
    pub model_type: String,
    /// Display name.
    pub display_name: String,
    /// Creation timestamp, zero when unknown.
    pub created_at: u64,
}

impl ModelInfo {
    /// Entry with the id doubling as display name.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            model_type: "model".to_string(),
            display_name: id.to_string(),
            created_at: 0,
        }
    }
}

/// Response for listing available models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// Available models.
    pub data: Vec<ModelInfo>,
    /// Whether more models exist beyond this page.
    pub has_more: bool,
}
