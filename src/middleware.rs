//! Middleware pipeline.
//!
//! Cross-cutting policies (logging, metrics, cost accounting, caching,
//! breaker and limiter stages) are [`Middleware`] values composed into a
//! [`Pipeline`] in front of a [`Backend`].
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Request Pipeline                           │
//! │                                                                  │
//! │   Request ──► [Middleware 0] ──► [Middleware 1] ──► ... ──┐      │
//! │               before_request()   before_request()         │      │
//! │                                                           ▼      │
//! │                                          ┌──────────────────┐    │
//! │                                          │ Backend.execute()│    │
//! │                                          └──────────────────┘    │
//! │                                                           │      │
//! │   Response ◄── [Middleware 0] ◄── [Middleware 1] ◄── ... ─┘      │
//! │               after_response()   after_response()                │
//! │               on_error()         on_error()                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invocation Rules
//!
//! - `before_request` runs left to right; each hook receives the request
//!   returned by the previous one.
//! - A hook at index `i` may short-circuit with a response. The backend is
//!   skipped and `after_response` runs over `[0, i)` right to left.
//! - A `before_request` error at index `i` is handled like a backend failure
//!   of the stack entered so far, `[0, i)`.
//! - On failure `on_error` runs right to left over the entered stack until a
//!   hook returns a substitute response. The `after_response` hooks of the
//!   middleware outside the recovering one then run on it.
//! - Dropping the invocation future runs no further hooks.
//!
//! # Example
//! ```ignore
//! use edgequake_pipeline::middleware::{LoggingMiddleware, MetricsMiddleware, Pipeline};
//!
//! let metrics = Arc::new(MetricsMiddleware::new());
//! let pipeline = Pipeline::new()
//!     .with(Arc::new(LoggingMiddleware::new()))
//!     .with(metrics.clone());
//!
//! let response = pipeline.execute(backend.as_ref(), request).await?;
//! println!("{}", metrics.summary());
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::traits::{Backend, Generator, Request, Response};

// ============================================================================
// Middleware Trait
// ============================================================================

/// Outcome of a `before_request` hook.
#[derive(Debug, Clone)]
pub enum BeforeRequest {
    /// Continue with this (possibly rewritten) request.
    Continue(Request),
    /// Skip the backend and answer with this response.
    ShortCircuit(Response),
}

/// A pipeline stage.
///
/// All hooks default to pass-through. Per-invocation state belongs in the
/// [`PipelineContext`], never in `self`.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Middleware name for debugging and logging.
    fn name(&self) -> &str;

    /// Called before the backend, left to right.
    async fn before_request(
        &self,
        ctx: &mut PipelineContext,
        request: Request,
    ) -> Result<BeforeRequest> {
        let _ = ctx;
        Ok(BeforeRequest::Continue(request))
    }

    /// Called after a response is available, right to left.
    async fn after_response(
        &self,
        ctx: &mut PipelineContext,
        response: Response,
    ) -> Result<Response> {
        let _ = ctx;
        Ok(response)
    }

    /// Called on failure, right to left. Return a response to recover.
    async fn on_error(&self, ctx: &mut PipelineContext, error: &PipelineError) -> Option<Response> {
        let _ = (ctx, error);
        None
    }
}

// ============================================================================
// Pipeline
// ============================================================================

enum Entry {
    Dispatch(Request),
    ShortCircuit { response: Response, index: usize },
    Failed { error: PipelineError, entered: usize },
}

/// Ordered middleware in front of a backend.
#[derive(Default, Clone)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Create a new empty pipeline.
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Append a middleware (builder form).
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add(middleware);
        self
    }

    /// Get the number of middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if the pipeline is empty.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Middleware names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Run one invocation against `backend` with a fresh context.
    pub async fn execute(&self, backend: &dyn Backend, request: Request) -> Result<Response> {
        let mut ctx = PipelineContext::new(&request);
        self.execute_with_context(backend, request, &mut ctx).await
    }

    /// Run one invocation with a caller-provided context.
    ///
    /// The context is left populated (cost, spans, cache-hit flag) so callers
    /// can inspect it afterwards.
    pub async fn execute_with_context(
        &self,
        backend: &dyn Backend,
        request: Request,
        ctx: &mut PipelineContext,
    ) -> Result<Response> {
        let span = info_span!(
            "pipeline",
            correlation_id = %ctx.correlation_id(),
            backend = %request.backend,
            model = %request.model,
        );
        self.run(backend, request, ctx).instrument(span).await
    }

    async fn run(
        &self,
        backend: &dyn Backend,
        request: Request,
        ctx: &mut PipelineContext,
    ) -> Result<Response> {
        match self.enter(ctx, request).await {
            Entry::ShortCircuit { response, index } => {
                debug!(
                    middleware = self.middlewares[index].name(),
                    "Pipeline short-circuited"
                );
                self.unwind(ctx, response, index).await
            }
            Entry::Failed { error, entered } => self.recover(ctx, error, entered).await,
            Entry::Dispatch(request) => {
                let started = tokio::time::Instant::now();
                let result = backend.execute(&request).await;
                ctx.record_span(backend.name(), started.elapsed());
                match result {
                    Ok(response) => self.unwind(ctx, response, self.middlewares.len()).await,
                    Err(error) => self.recover(ctx, error, self.middlewares.len()).await,
                }
            }
        }
    }

    async fn enter(&self, ctx: &mut PipelineContext, request: Request) -> Entry {
        let mut current = request;
        for (index, middleware) in self.middlewares.iter().enumerate() {
            current = match middleware.before_request(ctx, current).await {
                Ok(BeforeRequest::Continue(next)) => {
                    ctx.retarget(&next);
                    next
                }
                Ok(BeforeRequest::ShortCircuit(response)) => {
                    return Entry::ShortCircuit { response, index };
                }
                Err(error) => {
                    return Entry::Failed {
                        error,
                        entered: index,
                    };
                }
            };
        }
        Entry::Dispatch(current)
    }

    /// `after_response` over `[0, upto)`, right to left.
    async fn unwind(
        &self,
        ctx: &mut PipelineContext,
        response: Response,
        upto: usize,
    ) -> Result<Response> {
        let mut current = response;
        for middleware in self.middlewares[..upto].iter().rev() {
            current = middleware.after_response(ctx, current).await?;
        }
        Ok(current)
    }

    /// `on_error` over `[0, entered)`, right to left, until one recovers.
    async fn recover(
        &self,
        ctx: &mut PipelineContext,
        error: PipelineError,
        entered: usize,
    ) -> Result<Response> {
        for (index, middleware) in self.middlewares[..entered].iter().enumerate().rev() {
            if let Some(substitute) = middleware.on_error(ctx, &error).await {
                debug!(
                    middleware = middleware.name(),
                    error = %error,
                    "Middleware recovered from failure"
                );
                return self.unwind(ctx, substitute, index).await;
            }
        }
        Err(error)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("middlewares", &self.names())
            .finish()
    }
}

/// A pipeline bound to one backend.
#[derive(Clone)]
pub struct BoundPipeline {
    pipeline: Arc<Pipeline>,
    backend: Arc<dyn Backend>,
}

impl BoundPipeline {
    /// Bind a pipeline to a backend.
    pub fn new(pipeline: Arc<Pipeline>, backend: Arc<dyn Backend>) -> Self {
        Self { pipeline, backend }
    }

    /// The bound backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

#[async_trait]
impl Generator for BoundPipeline {
    async fn generate(&self, request: Request) -> Result<Response> {
        let request = if request.backend == self.backend.name() {
            request
        } else {
            request.with_backend(self.backend.name())
        };
        self.pipeline.execute(self.backend.as_ref(), request).await
    }
}

// ============================================================================
// Built-in Middleware Implementations
// ============================================================================

/// Log level for logging middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Minimal logging (request/response summary).
    #[default]
    Info,
    /// Detailed logging (includes message previews).
    Debug,
    /// Full logging (complete messages and responses).
    Trace,
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    }
}

/// Logging middleware that logs requests, responses and failures.
#[derive(Debug, Default)]
pub struct LoggingMiddleware {
    log_level: LogLevel,
}

impl LoggingMiddleware {
    /// Create a new logging middleware with default settings.
    pub fn new() -> Self {
        Self {
            log_level: LogLevel::Info,
        }
    }

    /// Create a logging middleware with specified log level.
    pub fn with_level(level: LogLevel) -> Self {
        Self { log_level: level }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before_request(
        &self,
        _ctx: &mut PipelineContext,
        request: Request,
    ) -> Result<BeforeRequest> {
        match self.log_level {
            LogLevel::Info => {
                info!(
                    backend = %request.backend,
                    model = %request.model,
                    messages = request.messages.len(),
                    tools = request.tools.len(),
                    "Request"
                );
            }
            LogLevel::Debug => {
                let last_message = request
                    .messages
                    .last()
                    .map(|m| format!("[{}] {}", m.role.as_str(), preview(&m.text(), 100)));
                debug!(
                    backend = %request.backend,
                    model = %request.model,
                    messages = request.messages.len(),
                    tools = request.tools.len(),
                    last_message = ?last_message,
                    "Request"
                );
            }
            LogLevel::Trace => {
                trace!(
                    backend = %request.backend,
                    model = %request.model,
                    messages = ?request.messages,
                    "Full request"
                );
            }
        }
        Ok(BeforeRequest::Continue(request))
    }

    async fn after_response(
        &self,
        ctx: &mut PipelineContext,
        response: Response,
    ) -> Result<Response> {
        let duration_ms = ctx.elapsed().as_millis() as u64;
        match self.log_level {
            LogLevel::Info => {
                info!(
                    model = %response.model,
                    tokens = response.usage.total(),
                    duration_ms,
                    cache_hit = ctx.is_cache_hit(),
                    finish_reason = ?response.finish_reason,
                    "Response"
                );
            }
            LogLevel::Debug => {
                debug!(
                    model = %response.model,
                    tokens = response.usage.total(),
                    duration_ms,
                    cache_hit = ctx.is_cache_hit(),
                    tool_calls = response.tool_calls.len(),
                    content_preview = %preview(&response.text, 200),
                    "Response"
                );
            }
            LogLevel::Trace => {
                trace!(model = %response.model, response = ?response, "Full response");
            }
        }
        Ok(response)
    }

    async fn on_error(&self, ctx: &mut PipelineContext, error: &PipelineError) -> Option<Response> {
        warn!(
            backend = %ctx.backend(),
            model = %ctx.model(),
            duration_ms = ctx.elapsed().as_millis() as u64,
            error = %error,
            "Request failed"
        );
        None
    }
}

/// Metrics middleware that tracks usage statistics.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cached_tokens: AtomicU64,
    total_time_ms: AtomicU64,
    tool_call_responses: AtomicU64,
}

impl MetricsMiddleware {
    /// Create a new metrics middleware.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the total number of completed requests (including failures).
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get the number of failed requests.
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Get the number of responses served by the semantic cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Get all metrics as a summary.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            cached_tokens: self.cached_tokens.load(Ordering::Relaxed),
            total_time_ms: self.total_time_ms.load(Ordering::Relaxed),
            tool_call_responses: self.tool_call_responses.load(Ordering::Relaxed),
        }
    }
}

/// Summary of pipeline metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    /// Completed requests (successes and failures).
    pub total_requests: u64,
    /// Requests that ended in an error.
    pub failed_requests: u64,
    /// Responses served by the semantic cache.
    pub cache_hits: u64,
    /// Total prompt tokens.
    pub input_tokens: u64,
    /// Total completion tokens.
    pub output_tokens: u64,
    /// Prompt tokens served from provider-side caches.
    pub cached_tokens: u64,
    /// Total time in milliseconds.
    pub total_time_ms: u64,
    /// Responses that requested tool calls.
    pub tool_call_responses: u64,
}

impl MetricsSummary {
    /// Get average latency in milliseconds.
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.total_requests as f64
        }
    }

    /// Total tokens (input + output).
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Get average tokens per successful request.
    pub fn average_tokens_per_request(&self) -> f64 {
        let succeeded = self.total_requests.saturating_sub(self.failed_requests);
        if succeeded == 0 {
            0.0
        } else {
            self.total_tokens() as f64 / succeeded as f64
        }
    }

    /// Percentage (0-100) of completed requests that failed.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.failed_requests as f64 / self.total_requests as f64) * 100.0
        }
    }

    /// Percentage (0-100) of completed requests served by the semantic cache.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / self.total_requests as f64) * 100.0
        }
    }
}

/// Compact single-line format for logging:
/// `reqs=10 errors=1 tokens=5000/1000/4000 cache=20.0% latency=150ms`
impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reqs={} errors={} tokens={}/{}/{} cache={:.1}% latency={:.0}ms",
            self.total_requests,
            self.failed_requests,
            self.input_tokens,
            self.output_tokens,
            self.cached_tokens,
            self.cache_hit_rate(),
            self.average_latency_ms()
        )
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn after_response(
        &self,
        ctx: &mut PipelineContext,
        response: Response,
    ) -> Result<Response> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_time_ms
            .fetch_add(ctx.elapsed().as_millis() as u64, Ordering::Relaxed);

        if ctx.is_cache_hit() || response.is_cache_hit() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.input_tokens
                .fetch_add(response.usage.input_tokens, Ordering::Relaxed);
            self.output_tokens
                .fetch_add(response.usage.output_tokens, Ordering::Relaxed);
            self.cached_tokens
                .fetch_add(response.usage.cached_tokens, Ordering::Relaxed);
        }

        if response.has_tool_calls() {
            self.tool_call_responses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(response)
    }

    async fn on_error(&self, ctx: &mut PipelineContext, _error: &PipelineError) -> Option<Response> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.total_time_ms
            .fetch_add(ctx.elapsed().as_millis() as u64, Ordering::Relaxed);
        None
    }
}

// ============================================================================
// Tests
// ============================================================================
