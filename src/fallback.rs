//! Fallback routing across an ordered list of backends.
//!
//! For each backend in attempt order the router:
//!
//! 1. retargets the request at the backend,
//! 2. asks the circuit breaker for a permit (denied → `CircuitOpen`, next),
//! 3. asks the rate limiter for a slot (denied → `Throttled`, next),
//! 4. runs the pipeline, optionally under a [`RetryStrategy`],
//! 5. records the outcome on the breaker and returns on success.
//!
//! `InvalidRequest` is surfaced immediately: another backend would reject
//! the same input. When every backend fails the caller gets
//! [`PipelineError::AggregateFallback`] with one reason per backend, in
//! attempt order.
//!
//! # Routing Policies
//!
//! | Policy | Attempt order |
//! |--------|---------------|
//! | `Ordered` | Configuration order |
//! | `RoundRobin` | Configuration order rotated by one per call |
//! | `LeastFailures` | Stable sort by counted failures so far |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{BackendFailure, PipelineError, Result, RetryStrategy};
use crate::middleware::Pipeline;
use crate::rate_limiter::RateLimiter;
use crate::registry::BackendRegistry;
use crate::retry::RetryExecutor;
use crate::traits::{Backend, Generator, Request, Response};

/// How the attempt order is chosen for each call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Always the configured order.
    #[default]
    Ordered,
    /// Rotate the starting backend on every call.
    RoundRobin,
    /// Prefer backends with fewer counted failures.
    LeastFailures,
}

/// A successful fallback call.
#[derive(Debug)]
pub struct FallbackOutcome {
    /// The response.
    pub response: Response,
    /// Backend that served it. Through the client, a semantic cache hit
    /// reports [`CACHE_BACKEND`](crate::CACHE_BACKEND).
    pub backend: String,
    /// Backends tried first and why they were skipped or failed.
    pub failures: Vec<BackendFailure>,
}

struct Route {
    backend: Arc<dyn Backend>,
    failures: AtomicU64,
}

/// Ordered fallback over registered backends.
pub struct FallbackRouter {
    routes: Vec<Route>,
    pipeline: Arc<Pipeline>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    policy: RoutingPolicy,
    retry: Option<RetryStrategy>,
    executor: RetryExecutor,
    cursor: AtomicUsize,
}

impl FallbackRouter {
    /// Build a router over `order`, resolving names in `registry`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `order` is empty, names an unknown backend or
    /// repeats a backend.
    pub fn new(
        registry: &BackendRegistry,
        order: &[String],
        pipeline: Arc<Pipeline>,
    ) -> Result<Self> {
        if order.is_empty() {
            return Err(PipelineError::Config(
                "fallback.backends must name at least one backend".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(order.len());
        for name in order {
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "Backend '{}' appears twice in fallback.backends",
                    name
                )));
            }
            routes.push(Route {
                backend: registry.require(name)?,
                failures: AtomicU64::new(0),
            });
        }

        Ok(Self {
            routes,
            pipeline,
            breaker: None,
            limiter: None,
            policy: RoutingPolicy::Ordered,
            retry: None,
            executor: RetryExecutor::new(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Gate every attempt on this breaker.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Gate every attempt on this limiter.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Set the routing policy.
    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Retry each backend under `strategy` before falling back.
    pub fn with_retry(mut self, strategy: RetryStrategy) -> Self {
        self.retry = Some(strategy);
        self
    }

    /// The routing policy.
    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Backend names in configuration order.
    pub fn backends(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.backend.name()).collect()
    }

    /// Counted failures per backend, in configuration order.
    pub fn failure_counts(&self) -> Vec<(String, u64)> {
        self.routes
            .iter()
            .map(|r| {
                (
                    r.backend.name().to_string(),
                    r.failures.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Attempt order for the next call, as indices into the routes.
    fn attempt_order(&self) -> Vec<usize> {
        let n = self.routes.len();
        match self.policy {
            RoutingPolicy::Ordered => (0..n).collect(),
            RoutingPolicy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                (0..n).map(|i| (start + i) % n).collect()
            }
            RoutingPolicy::LeastFailures => {
                let counts: Vec<u64> = self
                    .routes
                    .iter()
                    .map(|r| r.failures.load(Ordering::Relaxed))
                    .collect();
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by_key(|&i| counts[i]);
                order
            }
        }
    }

    async fn call(&self, backend: &Arc<dyn Backend>, request: Request) -> Result<Response> {
        match &self.retry {
            None => self.pipeline.execute(backend.as_ref(), request).await,
            Some(strategy) => {
                self.executor
                    .execute(strategy, || {
                        let pipeline = self.pipeline.clone();
                        let backend = backend.clone();
                        let request = request.clone();
                        async move { pipeline.execute(backend.as_ref(), request).await }
                    })
                    .await
            }
        }
    }

    /// Generate, reporting which backend served the response.
    pub async fn generate_with_report(&self, request: Request) -> Result<FallbackOutcome> {
        let order = self.attempt_order();
        let span = info_span!("fallback", policy = ?self.policy, backends = order.len());
        self.route(request, order).instrument(span).await
    }

    /// Generate on one named backend, gated by breaker and limiter like a
    /// single fallback attempt. Denials surface as-is.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `backend` is not one of the router's backends.
    pub async fn generate_on(&self, backend: &str, request: Request) -> Result<Response> {
        let route = self
            .routes
            .iter()
            .find(|r| r.backend.name() == backend)
            .ok_or_else(|| {
                PipelineError::Config(format!("Backend '{}' is not routed", backend))
            })?;
        self.attempt(route, &request).await
    }

    /// One gated attempt: breaker permit, limiter slot, pipeline, outcome.
    async fn attempt(&self, route: &Route, request: &Request) -> Result<Response> {
        let name = route.backend.name();

        let permit = match &self.breaker {
            Some(breaker) => match breaker.try_acquire(name) {
                Ok(permit) => Some(permit),
                Err(denied) => {
                    debug!(backend = %name, "Circuit open, skipping backend");
                    return Err(denied);
                }
            },
            None => None,
        };

        if let Some(limiter) = &self.limiter {
            if let Err(denied) = limiter.acquire(name).await {
                debug!(backend = %name, "Rate limited, skipping backend");
                // Dropping the permit frees a probe slot without an outcome.
                drop(permit);
                return Err(denied);
            }
        }

        let result = self.call(&route.backend, request.clone().with_backend(name)).await;
        match &result {
            Ok(_) => {
                if let Some(permit) = permit {
                    permit.record_success();
                }
            }
            Err(error) => {
                if let Some(permit) = permit {
                    permit.record_failure(error);
                }
                if error.counts_toward_breaker() {
                    route.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        result
    }

    async fn route(&self, request: Request, order: Vec<usize>) -> Result<FallbackOutcome> {
        let mut failures = Vec::new();

        for index in order {
            let route = &self.routes[index];
            let name = route.backend.name();

            match self.attempt(route, &request).await {
                Ok(response) => {
                    if !failures.is_empty() {
                        info!(
                            backend = %name,
                            skipped = failures.len(),
                            "Served by fallback backend"
                        );
                    }
                    return Ok(FallbackOutcome {
                        response,
                        backend: name.to_string(),
                        failures,
                    });
                }
                Err(error) if error.is_caller_error() => {
                    debug!(backend = %name, error = %error, "Caller error, not falling back");
                    return Err(error);
                }
                Err(error) => {
                    warn!(backend = %name, error = %error, "Attempt failed, falling back");
                    failures.push(BackendFailure::new(name, error));
                }
            }
        }

        warn!(attempts = failures.len(), "All backends failed");
        Err(PipelineError::AggregateFallback(failures))
    }
}

#[async_trait]
impl Generator for FallbackRouter {
    async fn generate(&self, request: Request) -> Result<Response> {
        self.generate_with_report(request)
            .await
            .map(|outcome| outcome.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::error::FailureKind;
    use crate::providers::MockBackend;
    use crate::rate_limiter::RateLimiterConfig;
    use std::time::Duration;

    fn registry(backends: &[&MockBackend]) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        for backend in backends {
            registry.register(Arc::new((*backend).clone())).unwrap();
        }
        registry
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn request() -> Request {
        Request::from_prompt("unused", "m", "hi")
    }

    #[test]
    fn test_construction_validation() {
        let a = MockBackend::new("a");
        let reg = registry(&[&a]);
        let pipeline = Arc::new(Pipeline::new());

        assert!(FallbackRouter::new(&reg, &[], pipeline.clone()).is_err());
        assert!(FallbackRouter::new(&reg, &names(&["a", "a"]), pipeline.clone()).is_err());
        assert!(FallbackRouter::new(&reg, &names(&["missing"]), pipeline.clone()).is_err());
        assert!(FallbackRouter::new(&reg, &names(&["a"]), pipeline).is_ok());
    }

    #[tokio::test]
    async fn test_first_healthy_backend_serves() {
        let a = MockBackend::failing("a", FailureKind::Unavailable);
        let b = MockBackend::new("b");
        b.add_response("from b");
        let c = MockBackend::new("c");

        let router = FallbackRouter::new(
            &registry(&[&a, &b, &c]),
            &names(&["a", "b", "c"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap();

        let outcome = router.generate_with_report(request()).await.unwrap();
        assert_eq!(outcome.response.text, "from b");
        assert_eq!(outcome.backend, "b");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].backend, "a");
        assert_eq!(c.call_count(), 0);
        assert_eq!(b.requests()[0].backend, "b");
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_backend_in_order() {
        let a = MockBackend::failing("a", FailureKind::Timeout);
        let b = MockBackend::failing("b", FailureKind::Throttled);
        let router = FallbackRouter::new(
            &registry(&[&a, &b]),
            &names(&["a", "b"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap();

        match router.generate(request()).await {
            Err(PipelineError::AggregateFallback(failures)) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].backend, "a");
                assert!(matches!(failures[0].error, PipelineError::Timeout));
                assert_eq!(failures[1].backend, "b");
                assert!(matches!(failures[1].error, PipelineError::Throttled { .. }));
            }
            other => panic!("Expected AggregateFallback, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_retried_elsewhere() {
        let a = MockBackend::failing("a", FailureKind::InvalidRequest);
        let b = MockBackend::new("b");
        let router = FallbackRouter::new(
            &registry(&[&a, &b]),
            &names(&["a", "b"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap();

        let err = router.generate(request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert_eq!(b.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_backend_without_call() {
        let a = MockBackend::failing("a", FailureKind::Unavailable);
        let b = MockBackend::new("b");
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new(
            1,
            Duration::from_secs(60),
        )));
        let router = FallbackRouter::new(
            &registry(&[&a, &b]),
            &names(&["a", "b"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap()
        .with_breaker(breaker.clone());

        router.generate(request()).await.unwrap();
        assert_eq!(breaker.state("a"), CircuitState::Open);

        let outcome = router.generate_with_report(request()).await.unwrap();
        assert_eq!(outcome.backend, "b");
        assert!(matches!(
            outcome.failures[0].error,
            PipelineError::CircuitOpen { .. }
        ));
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backend_is_skipped() {
        let a = MockBackend::new("a");
        let b = MockBackend::new("b");
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(1)));
        let router = FallbackRouter::new(
            &registry(&[&a, &b]),
            &names(&["a", "b"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap()
        .with_limiter(limiter);

        assert_eq!(router.generate_with_report(request()).await.unwrap().backend, "a");
        let outcome = router.generate_with_report(request()).await.unwrap();
        assert_eq!(outcome.backend, "b");
        assert!(matches!(
            outcome.failures[0].error,
            PipelineError::Throttled { .. }
        ));
    }

    #[tokio::test]
    async fn test_round_robin_rotates_start() {
        let a = MockBackend::new("a");
        let b = MockBackend::new("b");
        let c = MockBackend::new("c");
        let router = FallbackRouter::new(
            &registry(&[&a, &b, &c]),
            &names(&["a", "b", "c"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap()
        .with_policy(RoutingPolicy::RoundRobin);

        let mut served = Vec::new();
        for _ in 0..4 {
            served.push(router.generate_with_report(request()).await.unwrap().backend);
        }
        assert_eq!(served, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_least_failures_prefers_healthier_backend() {
        let a = MockBackend::new("a");
        a.add_failure(FailureKind::Unavailable);
        a.add_failure(FailureKind::Unavailable);
        let b = MockBackend::new("b");
        b.add_failure(FailureKind::Unavailable);
        let router = FallbackRouter::new(
            &registry(&[&a, &b]),
            &names(&["a", "b"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap()
        .with_policy(RoutingPolicy::LeastFailures);

        // a fails, b fails: counts a=1, b=1.
        assert!(router.generate(request()).await.is_err());
        // Tie keeps config order: a fails again (a=2), b serves.
        assert_eq!(router.generate_with_report(request()).await.unwrap().backend, "b");
        // b now has fewer failures and goes first.
        assert_eq!(router.generate_with_report(request()).await.unwrap().backend, "b");
        assert_eq!(
            router.failure_counts(),
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_before_falling_back() {
        let a = MockBackend::new("a");
        a.add_failure(FailureKind::Unavailable);
        a.add_response("second try");
        let b = MockBackend::new("b");
        let router = FallbackRouter::new(
            &registry(&[&a, &b]),
            &names(&["a", "b"]),
            Arc::new(Pipeline::new()),
        )
        .unwrap()
        .with_retry(RetryStrategy::network_backoff());

        let outcome = router.generate_with_report(request()).await.unwrap();
        assert_eq!(outcome.backend, "a");
        assert_eq!(outcome.response.text, "second try");
        assert_eq!(a.call_count(), 2);
        assert_eq!(b.call_count(), 0);
    }
}
