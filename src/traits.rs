//! Request/response data model and the backend contracts.
//!
//! # Key Traits
//!
//! - [`Backend`]: executes one normalized [`Request`] against one provider
//! - [`Embedder`]: turns text into vectors (used by the semantic cache)
//!
//! Both are consumed through `Arc<dyn _>` so concrete adapters (vendor HTTP
//! clients, mocks) plug in without touching the core.
//!
//! # Immutability
//!
//! [`Request`] and [`Response`] are plain values. Middleware never mutates a
//! request in place; builder methods consume `self` and return a new value,
//! which keeps a request reusable across retries and fallback attempts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::error::{PipelineError, Result};

// ============================================================================
// Conversation Types
// ============================================================================

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message for setting context.
    System,
    /// User input message.
    User,
    /// Assistant response message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl Role {
    /// Convert role to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Reference to an image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ImageRef {
    /// Publicly reachable URL.
    Url { url: String },
    /// Inline base64 data (without the `data:` prefix).
    Base64 { data: String, mime_type: String },
}

impl ImageRef {
    /// Create an image reference from a URL.
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }

    /// Create an image reference from base64 data.
    pub fn base64(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Base64 {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// URL form accepted by OpenAI-compatible APIs.
    ///
    /// Returns the URL itself, or `data:<mime>;base64,<data>` for inline data.
    pub fn to_api_url(&self) -> String {
        match self {
            Self::Url { url } => url.clone(),
            Self::Base64 { data, mime_type } => format!("data:{};base64,{}", mime_type, data),
        }
    }
}

/// One typed part of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// Image reference.
    Image { image: ImageRef },
    /// Result of a tool invocation.
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentPart {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Cache control hint for providers that support prompt caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    /// Cache type. Currently "ephemeral".
    #[serde(rename = "type")]
    pub cache_type: String,
}

impl CacheControl {
    /// Create an ephemeral cache control.
    pub fn ephemeral() -> Self {
        Self {
            cache_type: "ephemeral".to_string(),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Name of the tool to call.
    pub name: String,
    /// Arguments as a JSON object.
    #[serde(default)]
    pub arguments: JsonValue,
}

impl ToolCall {
    /// Create a new tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender.
    pub role: Role,

    /// Ordered content parts.
    pub content: Vec<ContentPart>,

    /// Tool calls made by the assistant (assistant role only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Prompt-caching breakpoint hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl Message {
    fn with_role(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            cache_control: None,
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, vec![ContentPart::text(text)])
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, vec![ContentPart::text(text)])
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, vec![ContentPart::text(text)])
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_tools(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(text)]
        };
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::with_role(
            Role::Tool,
            vec![ContentPart::ToolResult {
                tool_call_id: tool_call_id.into(),
                content: content.into(),
                is_error,
            }],
        )
    }

    /// Attach an image part.
    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.content.push(ContentPart::Image { image });
        self
    }

    /// Attach a cache breakpoint hint.
    pub fn with_cache_control(mut self, cache_control: CacheControl) -> Self {
        self.cache_control = Some(cache_control);
        self
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// Tool Definitions
// ============================================================================

/// Tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON Schema of the parameters.
    pub parameters: JsonValue,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonValue,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Structured-output constraint for the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    /// Schema name.
    pub name: String,
    /// JSON Schema the output must satisfy.
    pub schema: JsonValue,
}

/// Options for generation requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Maximum number of tokens to generate.
    pub max_tokens: Option<usize>,
    /// Temperature for sampling.
    pub temperature: Option<f32>,
    /// Stop sequences.
    pub stop: Option<Vec<String>>,
}

// ============================================================================
// Request
// ============================================================================

/// A normalized generate request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Target backend identifier.
    pub backend: String,

    /// Model requested from the backend.
    pub model: String,

    /// Ordered conversation.
    pub messages: Vec<Message>,

    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Optional structured-output constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<ResponseSchema>,

    /// Generation options.
    #[serde(default)]
    pub options: CompletionOptions,

    /// Precomputed embedding of the normalized prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_embedding: Option<Vec<f32>>,
}

impl Request {
    /// Create a new request.
    pub fn new(backend: impl Into<String>, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            messages,
            tools: Vec::new(),
            response_schema: None,
            options: CompletionOptions::default(),
            prompt_embedding: None,
        }
    }

    /// Create a single-turn request from a prompt.
    pub fn from_prompt(
        backend: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::new(backend, model, vec![Message::user(prompt)])
    }

    /// Same request aimed at another backend.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Same request with another model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Replace the conversation.
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// Append one message.
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Add tool definitions.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Constrain the response to a schema.
    pub fn with_response_schema(mut self, name: impl Into<String>, schema: JsonValue) -> Self {
        self.response_schema = Some(ResponseSchema {
            name: name.into(),
            schema,
        });
        self
    }

    /// Set generation options.
    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a precomputed prompt embedding.
    pub fn with_prompt_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.prompt_embedding = Some(embedding);
        self
    }

    /// Text of the last user message, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
    }

    /// Normalized prompt text: last user text, whitespace collapsed.
    ///
    /// Returns `None` when there is no user text.
    pub fn normalized_prompt(&self) -> Option<String> {
        let text = self.last_user_text()?;
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Token usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Prompt tokens served from the provider's cache.
    pub cached_tokens: u64,
}

impl Usage {
    /// Total tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Metadata key set on responses served by the semantic cache.
pub const CACHE_HIT_METADATA_KEY: &str = "cache_hit";

/// A normalized backend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Generated text.
    pub text: String,

    /// Tool calls requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Usage counters.
    #[serde(default)]
    pub usage: Usage,

    /// Model that produced the response.
    pub model: String,

    /// Finish reason (e.g. "stop", "length", "tool_calls").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Raw provider metadata.
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
}

impl Response {
    /// Create a new response.
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            model: model.into(),
            finish_reason: None,
            metadata: HashMap::new(),
        }
    }

    /// Set token usage.
    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage.input_tokens = input;
        self.usage.output_tokens = output;
        self
    }

    /// Set the number of provider-cached prompt tokens.
    pub fn with_cached_tokens(mut self, cached: u64) -> Self {
        self.usage.cached_tokens = cached;
        self
    }

    /// Set finish reason.
    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    /// Add tool calls.
    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check if the response has tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Whether this response was served by the semantic cache.
    pub fn is_cache_hit(&self) -> bool {
        self.metadata
            .get(CACHE_HIT_METADATA_KEY)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Parse the text as JSON (strips a surrounding markdown code fence).
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let mut text = self.text.trim();
        if let Some(rest) = text.strip_prefix("```") {
            let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
            text = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
        }
        serde_json::from_str(text).map_err(|e| {
            PipelineError::InvalidRequest(format!("Failed to parse structured output: {}", e))
        })
    }
}

// ============================================================================
// Backend Contracts
// ============================================================================

/// Executes one normalized request against one provider.
///
/// Failures must be classified: return `Throttled`, `BackendUnavailable`,
/// `InvalidRequest` or `Timeout` so breaker, limiter and fallback decisions
/// can be made without inspecting messages.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend identifier (unique within a registry).
    fn name(&self) -> &str;

    /// Execute one request.
    async fn execute(&self, request: &Request) -> Result<Response>;
}

/// Trait for providers that generate text embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Name of this embedder.
    fn name(&self) -> &str;

    /// Generate embeddings for a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generate the embedding for a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Internal("Empty embedding result".to_string()))
    }
}

/// Anything that turns a request into a response through the pipeline.
///
/// Implemented by [`crate::middleware::BoundPipeline`] (one backend) and
/// [`crate::fallback::FallbackRouter`] (ordered backends). The agent loop and
/// batch helpers depend only on this trait.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a response for the request.
    async fn generate(&self, request: Request) -> Result<Response>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_builder() {
        let response = Response::new("Hello, world!", "gpt-4o")
            .with_usage(10, 5)
            .with_cached_tokens(4)
            .with_finish_reason("stop");

        assert_eq!(response.text, "Hello, world!");
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.output_tokens, 5);
        assert_eq!(response.usage.cached_tokens, 4);
        assert_eq!(response.usage.total(), 15);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert!(!response.is_cache_hit());
    }

    #[test]
    fn test_cache_hit_flag() {
        let response =
            Response::new("cached", "m").with_metadata(CACHE_HIT_METADATA_KEY, json!(true));
        assert!(response.is_cache_hit());
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);

        let tool = Message::tool_result("call_1", "42", false);
        assert_eq!(tool.role, Role::Tool);
        assert!(matches!(
            &tool.content[0],
            ContentPart::ToolResult { tool_call_id, content, is_error: false }
                if tool_call_id == "call_1" && content == "42"
        ));
    }

    #[test]
    fn test_assistant_with_tools_omits_empty_text() {
        let msg = Message::assistant_with_tools("", vec![ToolCall::new("1", "f", json!({}))]);
        assert!(msg.content.is_empty());
        assert_eq!(msg.tool_calls.len(), 1);
    }

    #[test]
    fn test_message_text_skips_non_text_parts() {
        let msg = Message::user("What is this?").with_image(ImageRef::url("https://x/y.png"));
        assert_eq!(msg.text(), "What is this?");
        assert_eq!(msg.content.len(), 2);
    }

    #[test]
    fn test_normalized_prompt_uses_last_user_message() {
        let request = Request::new(
            "openai",
            "gpt-4o",
            vec![
                Message::system("be brief"),
                Message::user("first"),
                Message::assistant("ok"),
                Message::user("  What   is\n the weather? "),
            ],
        );
        assert_eq!(
            request.normalized_prompt().as_deref(),
            Some("What is the weather?")
        );
    }

    #[test]
    fn test_normalized_prompt_none_without_user_text() {
        let request = Request::new("openai", "gpt-4o", vec![Message::system("only system")]);
        assert!(request.normalized_prompt().is_none());
    }

    #[test]
    fn test_with_backend_leaves_original_untouched() {
        let original = Request::from_prompt("primary", "m", "hi");
        let retargeted = original.clone().with_backend("secondary");
        assert_eq!(original.backend, "primary");
        assert_eq!(retargeted.backend, "secondary");
        assert_eq!(original.messages, retargeted.messages);
    }

    #[test]
    fn test_image_ref_api_url() {
        assert_eq!(ImageRef::url("https://a/b.jpg").to_api_url(), "https://a/b.jpg");
        assert_eq!(
            ImageRef::base64("abc", "image/png").to_api_url(),
            "data:image/png;base64,abc"
        );
    }

    #[test]
    fn test_content_part_serialization() {
        let part = ContentPart::ToolResult {
            tool_call_id: "c1".to_string(),
            content: "done".to_string(),
            is_error: true,
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["is_error"], true);
    }

    #[test]
    fn test_cache_control_serialization() {
        let msg = Message::system("prompt").with_cache_control(CacheControl::ephemeral());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["cache_control"]["type"], "ephemeral");

        let plain = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(!plain.as_object().unwrap().contains_key("cache_control"));
    }

    #[test]
    fn test_parse_json_strips_code_fence() {
        #[derive(Deserialize)]
        struct Answer {
            value: u32,
        }
        let response = Response::new("```json\n{\"value\": 7}\n```", "m");
        let parsed: Answer = response.parse_json().unwrap();
        assert_eq!(parsed.value, 7);

        let bad = Response::new("not json", "m");
        assert!(bad.parse_json::<Answer>().is_err());
    }
}
