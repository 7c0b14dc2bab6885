//! Mock backend and embedder for testing.
//!
//! Deterministic, scriptable test doubles:
//! - [`MockBackend`]: queue of scripted replies (text, full responses, tool
//!   calls or classified failures), optional latency, call counting
//! - [`MockEmbedder`]: fixed vectors per text, or a deterministic
//!   bag-of-words embedding so near-identical prompts land close together
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  MockBackend                   MockEmbedder              │
//! │  ├── add_response()            ├── with_vector()         │
//! │  ├── add_tool_response()       ├── failing()             │
//! │  ├── add_failure()             └── embed()               │
//! │  ├── with_latency()                                      │
//! │  └── execute()                                           │
//! └──────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FailureKind, PipelineError, Result};
use crate::traits::{Backend, Embedder, Request, Response, ToolCall};

/// One scripted reply of a [`MockBackend`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Reply with this response.
    Respond(Response),
    /// Fail with this classification.
    Fail(FailureKind),
}

impl MockReply {
    fn into_result(self, backend: &str, request: &Request) -> Result<Response> {
        match self {
            Self::Respond(mut response) => {
                if response.model.is_empty() {
                    response.model = request.model.clone();
                }
                Ok(response)
            }
            Self::Fail(kind) => Err(mock_failure(backend, kind)),
        }
    }
}

fn mock_failure(backend: &str, kind: FailureKind) -> PipelineError {
    match kind {
        FailureKind::Throttled => PipelineError::throttled(backend),
        FailureKind::Unavailable => {
            PipelineError::BackendUnavailable(format!("{} returned 503", backend))
        }
        FailureKind::InvalidRequest => {
            PipelineError::InvalidRequest(format!("{} rejected the request", backend))
        }
        FailureKind::Timeout => PipelineError::Timeout,
    }
}

/// Scriptable mock backend.
///
/// Replies are consumed in FIFO order; once the queue is empty the fallback
/// reply is used (a fixed "Mock response" text by default).
#[derive(Debug, Clone)]
pub struct MockBackend {
    name: String,
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    fallback: Arc<Mutex<MockReply>>,
    requests: Arc<Mutex<Vec<Request>>>,
    call_count: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl MockBackend {
    /// Create a new mock backend with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(MockReply::Respond(Response::new(
                "Mock response",
                "",
            )))),
            requests: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(AtomicUsize::new(0)),
            latency: None,
        }
    }

    /// Mock backend that fails every call with the given classification.
    pub fn failing(name: impl Into<String>, kind: FailureKind) -> Self {
        let backend = Self::new(name);
        backend.set_fallback(MockReply::Fail(kind));
        backend
    }

    /// Sleep this long on every call (tokio timer).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reply used once the scripted queue is exhausted.
    pub fn set_fallback(&self, reply: MockReply) {
        *self.fallback.lock() = reply;
    }

    /// Add a text response to the queue.
    pub fn add_response(&self, text: impl Into<String>) {
        self.push(MockReply::Respond(Response::new(text, "")));
    }

    /// Add a response with tool calls to the queue.
    pub fn add_tool_response(&self, text: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.push(MockReply::Respond(
            Response::new(text, "")
                .with_tool_calls(tool_calls)
                .with_finish_reason("tool_calls"),
        ));
    }

    /// Add a full response to the queue.
    pub fn add_full_response(&self, response: Response) {
        self.push(MockReply::Respond(response));
    }

    /// Add a classified failure to the queue.
    pub fn add_failure(&self, kind: FailureKind) {
        self.push(MockReply::Fail(kind));
    }

    /// Add a scripted reply to the queue.
    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Number of `execute` calls received.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Check if all queued replies have been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.replies.lock().is_empty()
    }

    fn next_reply(&self) -> MockReply {
        let scripted = self.replies.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_reply().into_result(&self.name, request)
    }
}

// ============================================================================
// MockEmbedder
// ============================================================================

/// Deterministic mock embedder.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
    fixed: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    failing: Arc<AtomicBool>,
    call_count: Arc<AtomicUsize>,
}

impl MockEmbedder {
    /// Create a mock embedder producing vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            fixed: Arc::new(Mutex::new(HashMap::new())),
            failing: Arc::new(AtomicBool::new(false)),
            call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mock embedder whose every call fails.
    pub fn failing(dimension: usize) -> Self {
        let embedder = Self::new(dimension);
        embedder.set_failing(true);
        embedder
    }

    /// Return this vector for this exact text.
    pub fn with_vector(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.fixed.lock().insert(text.into(), vector);
        self
    }

    /// Toggle failure mode.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `embed` calls received.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Bag-of-words embedding: each lowercase word hashes to one slot.
    fn hashed_embedding(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let slot = (hasher.finish() % self.dimension as u64) as usize;
            vector[slot] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn name(&self) -> &str {
        "mock-embedder"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipelineError::BackendUnavailable(
                "embedding service unavailable".to_string(),
            ));
        }
        let fixed = self.fixed.lock().clone();
        Ok(texts
            .iter()
            .map(|text| {
                fixed
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| self.hashed_embedding(text))
            })
            .collect())
    }
}
