//! EdgeQuake Pipeline - LLM Request Orchestration
//!
//! A provider-agnostic layer between callers and remote LLM endpoints. A
//! logical generate or embed request runs through an ordered middleware
//! pipeline, is gated by per-backend circuit breakers and rate limiters, is
//! routed across fallback backends, may be served from a semantic cache, and
//! comes back as a normalized [`Response`].
//!
//! # Components
//!
//! | Component | Module | Purpose |
//! |-----------|--------|---------|
//! | Middleware pipeline | [`middleware`] | Ordered before/after/error hooks, short-circuiting |
//! | Circuit breaker | [`circuit_breaker`] | Closed → Open → HalfOpen per backend, single probe |
//! | Rate limiter | [`rate_limiter`] | Fixed window or token bucket, reject or wait |
//! | Semantic cache | [`cache`] | Cosine-similarity lookup per request scope, TTL, oldest-first eviction |
//! | Fallback router | [`fallback`] | Ordered / round-robin / least-failures attempts |
//! | Batch executor | [`batch`] | Bounded concurrency, input-ordered results |
//! | Agent loop | [`agent`] | Tool calls with a fixed tool-error budget |
//! | Tools / MCP | [`tools`], [`mcp`] | Local tools and MCP servers over stdio |
//! | Cost tracking | [`cost_tracker`] | Injected pricing, per-model and per-backend totals |
//!
//! # Architecture
//!
//! ```text
//! Client ─▶ FallbackRouter ─▶ breaker ▸ limiter ─▶ Pipeline ─▶ Backend
//!   │                                                 ▲
//!   ├─ Agent ───── Generator ─────────────────────────┘
//!   └─ BatchExecutor
//! ```
//!
//! # Example
//!
//! ```ignore
//! use edgequake_pipeline::{Client, OrchestratorConfig, Request};
//! use edgequake_pipeline::providers::{OpenAICompatibleBackend, OpenAICompatibleConfig};
//!
//! let client = Client::builder(OrchestratorConfig::load()?)
//!     .backend(Arc::new(OpenAICompatibleBackend::new(
//!         OpenAICompatibleConfig::openai_from_env()?,
//!     )?))
//!     .build()?;
//!
//! let response = client.generate(Request::from_prompt("", "gpt-4o", "Hello")).await?;
//! ```
//!
//! # Logging
//!
//! Everything is logged through `tracing`. The crate installs no subscriber.

pub mod agent;
pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod context;
pub mod cost_tracker;
pub mod error;
pub mod fallback;
pub mod mcp;
pub mod middleware;
pub mod providers;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod tools;
pub mod traits;

pub use agent::{Agent, AgentConfig, AgentRun, AgentStatus};
pub use batch::BatchExecutor;
pub use cache::{CacheStats, SemanticCache, SemanticCacheConfig, SemanticCacheMiddleware};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMiddleware, CircuitState,
};
pub use client::{Client, ClientBuilder, CACHE_BACKEND};
pub use config::{ConfigError, OrchestratorConfig};
pub use context::PipelineContext;
pub use cost_tracker::{
    format_cost, format_tokens, CostEntry, CostSummary, CostTracker, CostTrackingMiddleware,
    ModelPricing,
};
pub use error::{BackendFailure, FailureKind, PipelineError, Result, RetryStrategy, ToolError};
pub use fallback::{FallbackOutcome, FallbackRouter, RoutingPolicy};
pub use mcp::{McpClient, McpError, McpServerDescriptor, McpServerManager, McpSession};
pub use middleware::{
    BeforeRequest, BoundPipeline, LogLevel, LoggingMiddleware, MetricsMiddleware, MetricsSummary,
    Middleware, Pipeline,
};
pub use providers::{MockBackend, MockEmbedder, OpenAICompatibleBackend, OpenAICompatibleConfig};
pub use rate_limiter::{
    RateLimitAlgorithm, RateLimitMode, RateLimiter, RateLimiterConfig, RateLimiterMiddleware,
};
pub use registry::BackendRegistry;
pub use retry::RetryExecutor;
pub use tools::{FnTool, Tool, ToolDescriptor, ToolHandle, ToolRegistry};
pub use traits::{
    Backend, CacheControl, CompletionOptions, ContentPart, Embedder, Generator, ImageRef, Message,
    Request, Response, ResponseSchema, Role, ToolCall, ToolDefinition, Usage,
};
