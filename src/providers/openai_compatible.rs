//! Backend for OpenAI-compatible endpoints.
//!
//! Speaks the `/chat/completions` and `/embeddings` shapes shared by OpenAI,
//! xAI, Ollama, LM Studio, Groq, DeepSeek and similar services.
//!
//! # Failure Classification
//!
//! | HTTP outcome | Error |
//! |--------------|-------|
//! | 429 | `Throttled` (with `Retry-After` when sent) |
//! | 5xx | `BackendUnavailable` |
//! | other 4xx | `InvalidRequest` |
//! | client timeout | `Timeout` |
//! | connection failure | `BackendUnavailable` |
//!
//! # Example
//!
//! ```ignore
//! let openai = OpenAICompatibleBackend::new(
//!     OpenAICompatibleConfig::new("openai", "https://api.openai.com/v1")
//!         .with_api_key(std::env::var("OPENAI_API_KEY")?)
//!         .with_embedding_model("text-embedding-3-small"),
//! )?;
//! let ollama = OpenAICompatibleBackend::new(OpenAICompatibleConfig::ollama())?;
//! ```

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::traits::{
    Backend, ContentPart, Embedder, Message, Request, Response, Role, ToolCall,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings for one endpoint.
#[derive(Debug, Clone)]
pub struct OpenAICompatibleConfig {
    /// Backend id used in routing and logs.
    pub name: String,
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token. Local servers usually need none.
    pub api_key: Option<String>,
    /// Model used by [`Embedder::embed`].
    pub embedding_model: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// Extra headers on every request.
    pub headers: HashMap<String, String>,
}

impl OpenAICompatibleConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            embedding_model: None,
            timeout: DEFAULT_TIMEOUT,
            headers: HashMap::new(),
        }
    }

    /// OpenAI, keyed by `OPENAI_API_KEY`. `OPENAI_BASE_URL` overrides the URL.
    pub fn openai_from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            PipelineError::Config("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Ok(Self::new("openai", base_url).with_api_key(api_key))
    }

    /// Local Ollama server. `OLLAMA_HOST` overrides `http://localhost:11434`.
    pub fn ollama() -> Self {
        let host =
            std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost:11434".to_string());
        Self::new("ollama", format!("{}/v1", host.trim_end_matches('/')))
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize, PartialEq)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

// ============================================================================
// Conversion
// ============================================================================

fn convert_message(message: &Message) -> Vec<WireMessage> {
    if message.role == Role::Tool {
        // One wire message per tool result.
        return message
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => Some(WireMessage {
                    role: Role::Tool.as_str(),
                    content: Some(WireContent::Text(content.clone())),
                    tool_call_id: Some(tool_call_id.clone()),
                    tool_calls: Vec::new(),
                }),
                _ => None,
            })
            .collect();
    }

    let has_images = message
        .content
        .iter()
        .any(|part| matches!(part, ContentPart::Image { .. }));

    let content = if has_images {
        let parts = message
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(WirePart::Text { text: text.clone() }),
                ContentPart::Image { image } => Some(WirePart::ImageUrl {
                    image_url: WireImageUrl {
                        url: image.to_api_url(),
                    },
                }),
                ContentPart::ToolResult { .. } => None,
            })
            .collect();
        Some(WireContent::Parts(parts))
    } else {
        let text = message.text();
        if text.is_empty() && !message.tool_calls.is_empty() {
            None
        } else {
            Some(WireContent::Text(text))
        }
    };

    let tool_calls = message
        .tool_calls
        .iter()
        .map(|call| WireToolCall {
            id: call.id.clone(),
            call_type: function_type(),
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        })
        .collect();

    vec![WireMessage {
        role: message.role.as_str(),
        content,
        tool_call_id: None,
        tool_calls,
    }]
}

fn build_chat_request(request: &Request) -> ChatRequest<'_> {
    let tools = request
        .tools
        .iter()
        .map(|tool| WireTool {
            tool_type: "function",
            function: WireFunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        })
        .collect();

    let response_format = request.response_schema.as_ref().map(|schema| {
        serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "schema": schema.schema,
                "strict": true,
            }
        })
    });

    ChatRequest {
        model: &request.model,
        messages: request.messages.iter().flat_map(convert_message).collect(),
        tools,
        response_format,
        max_tokens: request.options.max_tokens,
        temperature: request.options.temperature,
        stop: request.options.stop.clone(),
    }
}

fn parse_tool_call(call: WireToolCall) -> ToolCall {
    // Models occasionally emit arguments that are not valid JSON.
    let arguments = if call.function.arguments.trim().is_empty() {
        JsonValue::Object(Default::default())
    } else {
        serde_json::from_str(&call.function.arguments)
            .unwrap_or(JsonValue::String(call.function.arguments))
    };
    ToolCall::new(call.id, call.function.name, arguments)
}

fn convert_response(backend: &str, request_model: &str, body: ChatResponse) -> Result<Response> {
    let choice = body.choices.into_iter().next().ok_or_else(|| {
        PipelineError::BackendUnavailable(format!("{} returned no choices", backend))
    })?;

    let (text, tool_calls) = match choice.message {
        Some(message) => (
            message.content.unwrap_or_default(),
            message.tool_calls.into_iter().map(parse_tool_call).collect(),
        ),
        None => (String::new(), Vec::new()),
    };

    let model = body
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| request_model.to_string());

    let mut response = Response::new(text, model).with_tool_calls(tool_calls);
    if let Some(usage) = body.usage {
        let cached = usage
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .unwrap_or(0);
        response = response
            .with_usage(usage.prompt_tokens, usage.completion_tokens)
            .with_cached_tokens(cached);
    }
    if let Some(reason) = choice.finish_reason {
        response = response.with_finish_reason(reason);
    }
    if let Some(id) = body.id {
        response = response.with_metadata("id", JsonValue::String(id));
    }
    Ok(response)
}

/// Map a non-success HTTP status onto the failure classification.
fn classify_status(
    backend: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> PipelineError {
    let detail = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect());

    if status == StatusCode::TOO_MANY_REQUESTS {
        PipelineError::Throttled {
            backend: backend.to_string(),
            retry_after,
        }
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        PipelineError::Timeout
    } else if status.is_server_error() {
        PipelineError::BackendUnavailable(format!(
            "{} returned {}: {}",
            backend,
            status.as_u16(),
            detail
        ))
    } else {
        PipelineError::InvalidRequest(format!(
            "{} rejected request ({}): {}",
            backend,
            status.as_u16(),
            detail
        ))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ============================================================================
// Backend
// ============================================================================

/// Backend and embedder for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAICompatibleBackend {
    config: OpenAICompatibleConfig,
    client: Client,
}

impl OpenAICompatibleBackend {
    /// Build the backend and its HTTP client.
    pub fn new(config: OpenAICompatibleConfig) -> Result<Self> {
        let client = Self::build_client(&config)?;
        Ok(Self { config, client })
    }

    fn build_client(config: &OpenAICompatibleConfig) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                PipelineError::Config(format!("Invalid header name '{}': {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                PipelineError::Config(format!("Invalid header value for '{}': {}", key, e))
            })?;
            headers.insert(name, value);
        }

        Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))
    }

    pub fn config(&self) -> &OpenAICompatibleConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<String> {
        let url = self.url(path);
        let mut builder = self.client.post(&url);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = builder.json(body).send().await.map_err(|e| {
            warn!(backend = %self.config.name, url = %url, error = %e, "HTTP request failed");
            PipelineError::from(e)
        })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await?;
        debug!(backend = %self.config.name, status = status.as_u16(), bytes = text.len(), "HTTP response");

        if !status.is_success() {
            let error = classify_status(&self.config.name, status, retry_after, &text);
            warn!(backend = %self.config.name, status = status.as_u16(), error = %error, "Backend returned error");
            return Err(error);
        }
        Ok(text)
    }
}

#[async_trait]
impl Backend for OpenAICompatibleBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        let body = build_chat_request(request);
        let text = self.post("chat/completions", &body).await?;
        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            PipelineError::BackendUnavailable(format!(
                "{} sent an unreadable response: {}",
                self.config.name, e
            ))
        })?;
        convert_response(&self.config.name, &request.model, parsed)
    }
}

#[async_trait]
impl Embedder for OpenAICompatibleBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.config.embedding_model.as_deref().ok_or_else(|| {
            PipelineError::NotSupported(format!(
                "Backend '{}' has no embedding model configured",
                self.config.name
            ))
        })?;

        let text = self
            .post("embeddings", &EmbeddingRequest { model, input: texts })
            .await?;
        let mut parsed: EmbeddingResponse = serde_json::from_str(&text)?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{CompletionOptions, ImageRef, ToolDefinition};
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        let throttled = classify_status(
            "openai",
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            "",
        );
        match throttled {
            PipelineError::Throttled {
                backend,
                retry_after,
            } => {
                assert_eq!(backend, "openai");
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("Expected Throttled, got {:?}", other),
        }

        assert!(matches!(
            classify_status("x", StatusCode::SERVICE_UNAVAILABLE, None, ""),
            PipelineError::BackendUnavailable(_)
        ));
        assert!(matches!(
            classify_status("x", StatusCode::GATEWAY_TIMEOUT, None, ""),
            PipelineError::Timeout
        ));

        let body = r#"{"error": {"message": "model not found"}}"#;
        match classify_status("x", StatusCode::NOT_FOUND, None, body) {
            PipelineError::InvalidRequest(msg) => assert!(msg.contains("model not found")),
            other => panic!("Expected InvalidRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_chat_request_body() {
        let request = Request::new(
            "openai",
            "gpt-4o",
            vec![
                Message::system("Be brief."),
                Message::user("Describe"),
            ],
        )
        .with_tools(vec![ToolDefinition::new("lookup", "Look up", json!({"type": "object"}))])
        .with_response_schema("answer", json!({"type": "object"}))
        .with_options(CompletionOptions {
            max_tokens: Some(64),
            temperature: Some(0.2),
            stop: None,
        });

        let body = serde_json::to_value(build_chat_request(&request)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(body["response_format"]["json_schema"]["name"], "answer");
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn test_image_and_tool_messages() {
        let with_image = Message::user("What is this?").with_image(ImageRef::Base64 {
            data: "AAAA".to_string(),
            mime_type: "image/png".to_string(),
        });
        let wire = convert_message(&with_image);
        let value = serde_json::to_value(&wire[0]).unwrap();
        assert_eq!(value["content"][0], json!({"type": "text", "text": "What is this?"}));
        assert_eq!(
            value["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );

        let assistant = Message::assistant_with_tools(
            "",
            vec![ToolCall::new("call_1", "lookup", json!({"q": "rust"}))],
        );
        let value = serde_json::to_value(&convert_message(&assistant)[0]).unwrap();
        assert!(value.get("content").is_none());
        assert_eq!(value["tool_calls"][0]["function"]["arguments"], r#"{"q":"rust"}"#);

        let result = Message::tool_result("call_1", "found", false);
        let value = serde_json::to_value(&convert_message(&result)[0]).unwrap();
        assert_eq!(
            value,
            json!({"role": "tool", "content": "found", "tool_call_id": "call_1"})
        );
    }

    #[test]
    fn test_response_conversion() {
        let body: ChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\": \"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 20,
                "prompt_tokens_details": {"cached_tokens": 64}
            }
        }))
        .unwrap();

        let response = convert_response("openai", "gpt-4o", body).unwrap();
        assert_eq!(response.model, "gpt-4o-2024-08-06");
        assert_eq!(response.text, "");
        assert_eq!(response.tool_calls[0].arguments, json!({"q": "rust"}));
        assert_eq!(response.usage.input_tokens, 100);
        assert_eq!(response.usage.cached_tokens, 64);
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(response.metadata["id"], "chatcmpl-1");
    }

    #[test]
    fn test_empty_choices_is_unavailable() {
        let body: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            convert_response("x", "m", body),
            Err(PipelineError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_malformed_tool_arguments_kept_as_string() {
        let call = parse_tool_call(WireToolCall {
            id: "c".to_string(),
            call_type: function_type(),
            function: WireFunctionCall {
                name: "f".to_string(),
                arguments: "{not json".to_string(),
            },
        });
        assert_eq!(call.arguments, JsonValue::String("{not json".to_string()));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let config = OpenAICompatibleConfig::new("x", "http://localhost").with_header("bad header", "v");
        assert!(matches!(
            OpenAICompatibleBackend::new(config),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_url_join() {
        let backend =
            OpenAICompatibleBackend::new(OpenAICompatibleConfig::new("x", "http://localhost:1234/v1/"))
                .unwrap();
        assert_eq!(backend.url("chat/completions"), "http://localhost:1234/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_embed_without_model_not_supported() {
        let backend =
            OpenAICompatibleBackend::new(OpenAICompatibleConfig::new("x", "http://localhost")).unwrap();
        assert!(matches!(
            backend.embed(&["hi".to_string()]).await,
            Err(PipelineError::NotSupported(_))
        ));
    }
}
