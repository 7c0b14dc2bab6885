//! Client facade.
//!
//! Owns the backend registry, the two middleware pipelines, the shared
//! resilience components and the fallback router, all built from one
//! [`OrchestratorConfig`]. No global state: construct one client and pass it
//! (or an `Arc` of it) wherever it is needed.
//!
//! ```text
//! generate ─▶ Logging ▸ Metrics ▸ SemanticCache ─▶ FallbackRouter
//!                                                     │ per backend
//!                               [breaker ▸ limiter] ─▶ CostTracking ▸ user ─▶ Backend
//! ```
//!
//! A cache hit is answered before the router, so it never takes a breaker
//! permit or a rate-limit slot and is served even while every circuit is
//! open. Metrics count one request per caller call; costs and user
//! middleware see every backend attempt.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::builder(OrchestratorConfig::load()?)
//!     .backend(Arc::new(OpenAICompatibleBackend::new(OpenAICompatibleConfig::openai_from_env()?)?))
//!     .backend(Arc::new(OpenAICompatibleBackend::new(OpenAICompatibleConfig::ollama())?))
//!     .pricing("gpt-4o", ModelPricing::new(2.5, 10.0))
//!     .build()?;
//!
//! let response = client
//!     .generate(Request::from_prompt("", "gpt-4o", "Hello"))
//!     .await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::{Agent, AgentConfig};
use crate::batch::BatchExecutor;
use crate::cache::{SemanticCache, SemanticCacheMiddleware};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::OrchestratorConfig;
use crate::cost_tracker::{CostSummary, CostTracker, CostTrackingMiddleware, ModelPricing};
use crate::error::{BackendFailure, PipelineError, Result, RetryStrategy};
use crate::fallback::{FallbackOutcome, FallbackRouter};
use crate::mcp::{McpError, McpServerManager};
use crate::middleware::{LoggingMiddleware, MetricsMiddleware, MetricsSummary, Middleware, Pipeline};
use crate::rate_limiter::RateLimiter;
use crate::registry::BackendRegistry;
use crate::traits::{Backend, Embedder, Generator, Request, Response};

/// `FallbackOutcome::backend` of a response served from the semantic cache.
pub const CACHE_BACKEND: &str = "semantic_cache";

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: OrchestratorConfig,
    backends: Vec<Arc<dyn Backend>>,
    embedder: Option<Arc<dyn Embedder>>,
    pricing: Vec<(String, ModelPricing)>,
    middlewares: Vec<Arc<dyn Middleware>>,
    retry: Option<RetryStrategy>,
    mcp: Option<Arc<McpServerManager>>,
}

impl ClientBuilder {
    /// Start a builder from a configuration. Nothing is validated until
    /// [`build`](Self::build).
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            backends: Vec::new(),
            embedder: None,
            pricing: Vec::new(),
            middlewares: Vec::new(),
            retry: None,
            mcp: None,
        }
    }

    /// Register a backend. Without `[fallback] backends` the registration
    /// order is the fallback order.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Embedder for the semantic cache and [`Client::embed`].
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Price a model (exact name or prefix).
    pub fn pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.push((model.into(), pricing));
        self
    }

    /// Append a middleware to the per-backend pipeline, after cost tracking.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Retry each backend under `strategy` before falling back.
    pub fn retry(mut self, strategy: RetryStrategy) -> Self {
        self.retry = Some(strategy);
        self
    }

    /// Use this MCP manager for agents instead of one built from
    /// `[mcp_servers]`.
    pub fn mcp(mut self, manager: Arc<McpServerManager>) -> Self {
        self.mcp = Some(manager);
        self
    }

    /// Validate the configuration and assemble the client.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration, a duplicate or unknown
    /// backend name, no backends at all, or an enabled semantic cache
    /// without an embedder.
    pub fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate()?;

        let mut registry = BackendRegistry::new();
        let mut registration_order = Vec::with_capacity(self.backends.len());
        for backend in self.backends {
            registration_order.push(backend.name().to_string());
            registry.register(backend)?;
        }
        if let Some(embedder) = &self.embedder {
            registry.register_embedder("default", embedder.clone());
        }
        let registry = Arc::new(registry);

        let metrics = Arc::new(MetricsMiddleware::new());
        let mut front = Pipeline::new()
            .with(Arc::new(LoggingMiddleware::new()))
            .with(metrics.clone());

        let cache = if config.semantic_cache.enabled {
            let embedder = self.embedder.clone().ok_or_else(|| {
                PipelineError::Config(
                    "semantic_cache.enabled requires an embedder".to_string(),
                )
            })?;
            let cache = Arc::new(SemanticCache::new(config.semantic_cache_config(), embedder));
            front.add(Arc::new(SemanticCacheMiddleware::new(cache.clone())));
            Some(cache)
        } else {
            None
        };

        let costs = Arc::new(CostTracker::new());
        for (model, pricing) in self.pricing {
            costs.set_pricing(model, pricing);
        }
        let mut attempts = Pipeline::new().with(Arc::new(CostTrackingMiddleware::new(costs.clone())));
        for middleware in self.middlewares {
            attempts.add(middleware);
        }
        let attempts = Arc::new(attempts);

        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker_config()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter_config()));

        let order = if config.fallback.backends.is_empty() {
            registration_order
        } else {
            config.fallback.backends.clone()
        };
        let mut router = FallbackRouter::new(&registry, &order, attempts.clone())?
            .with_breaker(breaker.clone())
            .with_limiter(limiter.clone())
            .with_policy(config.fallback.policy);
        if let Some(strategy) = self.retry {
            router = router.with_retry(strategy);
        }
        let router = Arc::new(router);

        let mcp = match self.mcp {
            Some(manager) => Some(manager),
            None if !config.mcp_servers.is_empty() => {
                let manager = McpServerManager::new();
                for (name, descriptor) in &config.mcp_servers {
                    manager.add_server(name.clone(), descriptor.clone());
                }
                Some(Arc::new(manager))
            }
            None => None,
        };

        info!(
            backends = order.len(),
            front_middlewares = front.len(),
            attempt_middlewares = attempts.len(),
            cache = cache.is_some(),
            "Client built"
        );

        Ok(Client {
            registry,
            frontend: Arc::new(Frontend {
                pipeline: Arc::new(front),
                router: router.clone(),
            }),
            breaker,
            limiter,
            cache,
            costs,
            metrics,
            router,
            batch: BatchExecutor::new(config.batch.concurrency)?,
            agent_config: config.agent,
            embedder: self.embedder,
            mcp,
        })
    }
}

/// The router, or one routed backend, as the backend of the caller-facing
/// pipeline. Records who served the response.
struct RoutedDispatch {
    router: Arc<FallbackRouter>,
    target: Option<String>,
    served: Mutex<Option<(String, Vec<BackendFailure>)>>,
}

#[async_trait]
impl Backend for RoutedDispatch {
    fn name(&self) -> &str {
        self.target.as_deref().unwrap_or("fallback")
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        let outcome = match &self.target {
            Some(name) => FallbackOutcome {
                response: self.router.generate_on(name, request.clone()).await?,
                backend: name.clone(),
                failures: Vec::new(),
            },
            None => self.router.generate_with_report(request.clone()).await?,
        };
        *self.served.lock() = Some((outcome.backend, outcome.failures));
        Ok(outcome.response)
    }
}

/// Caller-facing stage: logging, metrics and the semantic cache in front of
/// the router.
struct Frontend {
    pipeline: Arc<Pipeline>,
    router: Arc<FallbackRouter>,
}

impl Frontend {
    async fn dispatch(&self, target: Option<&str>, request: Request) -> Result<FallbackOutcome> {
        let dispatch = RoutedDispatch {
            router: self.router.clone(),
            target: target.map(str::to_string),
            served: Mutex::new(None),
        };
        let response = self.pipeline.execute(&dispatch, request).await?;
        let (backend, failures) = dispatch
            .served
            .into_inner()
            .unwrap_or_else(|| (CACHE_BACKEND.to_string(), Vec::new()));
        Ok(FallbackOutcome {
            response,
            backend,
            failures,
        })
    }
}

#[async_trait]
impl Generator for Frontend {
    async fn generate(&self, request: Request) -> Result<Response> {
        self.dispatch(None, request).await.map(|outcome| outcome.response)
    }
}

/// Entry point for generation, embedding, batches and agents.
pub struct Client {
    registry: Arc<BackendRegistry>,
    frontend: Arc<Frontend>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<SemanticCache>>,
    costs: Arc<CostTracker>,
    metrics: Arc<MetricsMiddleware>,
    router: Arc<FallbackRouter>,
    batch: BatchExecutor,
    agent_config: AgentConfig,
    embedder: Option<Arc<dyn Embedder>>,
    mcp: Option<Arc<McpServerManager>>,
}

impl Client {
    /// Shorthand for [`ClientBuilder::new`].
    pub fn builder(config: OrchestratorConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Generate: semantic cache first, then the fallback router.
    pub async fn generate(&self, request: Request) -> Result<Response> {
        self.frontend.generate(request).await
    }

    /// Generate and report the serving backend ([`CACHE_BACKEND`] for a
    /// cache hit).
    pub async fn generate_with_report(&self, request: Request) -> Result<FallbackOutcome> {
        self.frontend.dispatch(None, request).await
    }

    /// Generate on one named backend, still gated by breaker and limiter.
    /// The semantic cache is consulted first.
    pub async fn generate_on(&self, backend: &str, request: Request) -> Result<Response> {
        self.registry.require(backend)?;
        self.frontend
            .dispatch(Some(backend), request)
            .await
            .map(|outcome| outcome.response)
    }

    /// Embed texts with the configured embedder.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| PipelineError::NotSupported("No embedder configured".to_string()))?;
        embedder.embed(texts).await
    }

    /// Generate every request like [`generate`](Self::generate),
    /// `[batch] concurrency` at a time. Results are in request order.
    pub async fn generate_batch(&self, requests: Vec<Request>) -> Vec<Result<Response>> {
        debug!(requests = requests.len(), "Submitting batch");
        self.batch
            .run(requests, |request| self.frontend.generate(request))
            .await
    }

    /// An agent for `model` generating like [`generate`](Self::generate),
    /// with the `[agent]` limits and MCP servers.
    pub fn agent(&self, model: impl Into<String>) -> Agent {
        let generator: Arc<dyn Generator> = self.frontend.clone();
        let agent = Agent::new(generator, model).with_config(self.agent_config.clone());
        match &self.mcp {
            Some(manager) => agent.with_mcp(manager.clone()),
            None => agent,
        }
    }

    /// Launch configured MCP servers. Returns the ones that failed.
    pub async fn connect_mcp(&self) -> Vec<(String, McpError)> {
        match &self.mcp {
            Some(manager) => manager.connect_all().await,
            None => Vec::new(),
        }
    }

    /// Registered backends and embedders.
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// The fallback router. Calling it directly skips the caller-facing
    /// pipeline (no cache, no metrics).
    pub fn router(&self) -> &Arc<FallbackRouter> {
        &self.router
    }

    /// Shared circuit breaker, keyed by backend name.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Shared rate limiter, keyed by backend name.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The semantic cache, when enabled.
    pub fn semantic_cache(&self) -> Option<&Arc<SemanticCache>> {
        self.cache.as_ref()
    }

    /// Cost tracker fed by every backend attempt.
    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    /// MCP manager used by [`agent`](Self::agent), if any.
    pub fn mcp(&self) -> Option<&Arc<McpServerManager>> {
        self.mcp.as_ref()
    }

    /// Cost totals so far.
    pub fn cost_summary(&self) -> CostSummary {
        self.costs.summary()
    }

    /// Request metrics so far, one request per caller call.
    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}
