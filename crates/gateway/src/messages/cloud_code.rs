use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cloud-Code generate request envelope.
///
/// Sent to `<base>/v1internal:streamGenerateContent?alt=sse` (streaming) or
/// `<base>/v1internal:generateContent` (non-streaming). The envelope wraps
/// the actual request body with the model id and the account's project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// The model identifier.
    pub model: String,
    /// The account's project id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// The conversation payload.
    pub request: GenerateBody,
}

/// The conversation payload inside the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    /// Conversation turns.
    pub contents: Vec<Content>,
    /// System instruction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Function declarations the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDecl>>,
    /// Function calling policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    /// Sampling and output configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

/// One conversation turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    /// "user" or "model". Absent on system instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Ordered content parts.
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A content part. Exactly one payload field is set per part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Text payload. Also used for thinking text when `thought` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Marks this part as model thinking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    /// Opaque thinking signature, preserved byte-exact across turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    /// A function call issued by the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    /// A function result sent back by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
    /// Inline binary data (images).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    /// Plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// A function call part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Call identifier, correlating with a later function response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Function name.
    pub name: String,
    /// Call arguments.
    #[serde(default)]
    pub args: Value,
}

/// A function response part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    /// Identifier of the call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Function name.
    pub name: String,
    /// The result payload.
    pub response: Value,
}

/// Inline binary data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    /// Media type, e.g. "image/png".
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Function declarations available to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDecl {
    /// The declared functions.
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Declaration of one callable function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    /// Function name.
    pub name: String,
    /// What the function does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parameter schema, scrubbed of fields the backend rejects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Function calling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    /// Calling mode and allow-list.
    pub function_calling_config: FunctionCallingConfig,
}

/// Calling mode and optional allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallingConfig {
    /// "AUTO", "ANY" or "NONE".
    pub mode: String,
    /// Restricts callable functions when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

/// Sampling and output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Randomness control.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Maximum tokens in the candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Thinking configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

/// Thinking configuration inside the generation config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    /// Whether thought parts are returned.
    pub include_thoughts: bool,
    /// Thinking token budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

/// One SSE chunk (or the full non-streaming body) from the backend. The
/// v1internal surface wraps the response in a `response` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateChunk {
    /// The wrapped response, absent on keep-alive chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<GenerateResponse>,
}

/// Response body with candidates and usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    /// Generated candidates; the proxy uses the first.
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Token accounting, usually on the final chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    /// Response identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Concrete model version that served the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

/// One generated candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Generated content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// "STOP", "MAX_TOKENS", etc.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Candidate index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// Token accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_token_count: u32,
    /// Candidate tokens.
    #[serde(default)]
    pub candidates_token_count: u32,
    /// Thinking tokens.
    #[serde(default)]
    pub thoughts_token_count: u32,
    /// Total tokens.
    #[serde(default)]
    pub total_token_count: u32,
}

/// Error body returned by the backend, `{"error": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusError {
    /// The error payload.
    pub error: StatusErrorBody,
}

/// Error payload with gRPC-style status.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusErrorBody {
    /// Numeric code matching the HTTP status.
    #[serde(default)]
    pub code: u16,
    /// Human-readable message, e.g. "quota will reset after 1h 2m 3s".
    #[serde(default)]
    pub message: String,
    /// "RESOURCE_EXHAUSTED", "UNAUTHENTICATED", "PERMISSION_DENIED", ...
    #[serde(default)]
    pub status: String,
}
