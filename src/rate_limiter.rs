//! Per-backend rate limiting.
//!
//! Each key (backend id) gets its own counter behind its own lock:
//!
//! - **Fixed window** (default): at most `requests_per_minute` admissions per
//!   60 s window; the count resets when the window has elapsed.
//! - **Token bucket**: capacity `requests_per_minute`, refilled continuously
//!   at `requests_per_minute / 60` tokens per second.
//!
//! In [`RateLimitMode::Reject`] (default) a denied call fails immediately
//! with `Throttled { retry_after }`. In [`RateLimitMode::Wait`] the caller
//! sleeps on the tokio timer until a slot frees up, for at most `max_wait`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::middleware::{BeforeRequest, Middleware};
use crate::traits::Request;

const WINDOW: Duration = Duration::from_secs(60);

/// Counting algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Fixed 60 s window.
    #[default]
    FixedWindow,
    /// Continuously refilled token bucket.
    TokenBucket,
}

/// What to do when a call is denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitMode {
    /// Fail immediately with `Throttled`.
    #[default]
    Reject,
    /// Sleep until a slot frees, up to `max_wait`.
    Wait {
        /// Longest total time to wait before giving up.
        max_wait: Duration,
    },
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum admissions per minute, per key.
    pub requests_per_minute: u32,
    /// Counting algorithm.
    pub algorithm: RateLimitAlgorithm,
    /// Denial behavior.
    pub mode: RateLimitMode,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            algorithm: RateLimitAlgorithm::FixedWindow,
            mode: RateLimitMode::Reject,
        }
    }
}

impl RateLimiterConfig {
    /// Create a config with the given per-minute limit.
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            ..Default::default()
        }
    }

    /// Use the given algorithm.
    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Wait up to `max_wait` instead of rejecting.
    pub fn with_wait(mut self, max_wait: Duration) -> Self {
        self.mode = RateLimitMode::Wait { max_wait };
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(PipelineError::Config(
                "rate_limit.requests_per_minute must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Counters
// ============================================================================

#[derive(Debug)]
struct FixedWindow {
    capacity: u32,
    count: u32,
    window_start: Instant,
}

impl FixedWindow {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            count: 0,
            window_start: Instant::now(),
        }
    }

    fn roll(&mut self) -> Duration {
        let elapsed = self.window_start.elapsed();
        if elapsed >= WINDOW {
            self.count = 0;
            self.window_start = Instant::now();
            Duration::ZERO
        } else {
            elapsed
        }
    }

    fn try_take(&mut self) -> std::result::Result<(), Duration> {
        let elapsed = self.roll();
        if self.count < self.capacity {
            self.count += 1;
            Ok(())
        } else {
            Err(WINDOW - elapsed)
        }
    }

    fn available(&mut self) -> u32 {
        self.roll();
        self.capacity - self.count
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }

    fn available(&mut self) -> u32 {
        self.refill();
        self.tokens.floor() as u32
    }
}

#[derive(Debug)]
enum Counter {
    Fixed(FixedWindow),
    Bucket(TokenBucket),
}

impl Counter {
    fn new(config: &RateLimiterConfig) -> Self {
        let capacity = config.requests_per_minute;
        match config.algorithm {
            RateLimitAlgorithm::FixedWindow => Self::Fixed(FixedWindow::new(capacity)),
            RateLimitAlgorithm::TokenBucket => Self::Bucket(TokenBucket::new(
                capacity as f64,
                capacity as f64 / WINDOW.as_secs_f64(),
            )),
        }
    }

    /// Admit one call, or report how long until the next slot.
    fn try_take(&mut self) -> std::result::Result<(), Duration> {
        match self {
            Self::Fixed(window) => window.try_take(),
            Self::Bucket(bucket) => bucket.try_take(),
        }
    }

    fn available(&mut self) -> u32 {
        match self {
            Self::Fixed(window) => window.available(),
            Self::Bucket(bucket) => bucket.available(),
        }
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Rate limiter keyed by backend.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    counters: RwLock<HashMap<String, Arc<Mutex<Counter>>>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn counter(&self, key: &str) -> Arc<Mutex<Counter>> {
        if let Some(counter) = self.counters.read().get(key) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Counter::new(&self.config))))
            .clone()
    }

    fn throttled(key: &str, retry_after: Duration) -> PipelineError {
        PipelineError::Throttled {
            backend: key.to_string(),
            retry_after: Some(retry_after),
        }
    }

    /// Try to admit one call for `key` without waiting.
    pub fn try_acquire(&self, key: &str) -> Result<()> {
        let counter = self.counter(key);
        let result = counter.lock().try_take();
        result.map_err(|retry_after| {
            debug!(backend = %key, retry_after_ms = retry_after.as_millis() as u64, "Rate limited");
            Self::throttled(key, retry_after)
        })
    }

    /// Admit one call for `key`, honoring the configured mode.
    pub async fn acquire(&self, key: &str) -> Result<()> {
        let max_wait = match self.config.mode {
            RateLimitMode::Reject => return self.try_acquire(key),
            RateLimitMode::Wait { max_wait } => max_wait,
        };

        let counter = self.counter(key);
        let started = Instant::now();
        loop {
            let attempt = counter.lock().try_take();
            let wait = match attempt {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let waited = started.elapsed();
            if waited + wait > max_wait {
                debug!(
                    backend = %key,
                    waited_ms = waited.as_millis() as u64,
                    "Rate limit wait budget exhausted"
                );
                return Err(Self::throttled(key, wait));
            }

            debug!(
                backend = %key,
                wait_ms = wait.as_millis() as u64,
                "Rate limited: waiting for request slot"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Remaining admissions for `key` right now.
    pub fn available(&self, key: &str) -> u32 {
        self.counter(key).lock().available()
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// The limiter as a pipeline stage for single-backend pipelines.
///
/// Do not add it to a pipeline driven by [`crate::fallback::FallbackRouter`],
/// which already gates every attempt on the limiter.
pub struct RateLimiterMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimiterMiddleware {
    /// Wrap a shared limiter.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimiterMiddleware {
    fn name(&self) -> &str {
        "rate_limiter"
    }

    async fn before_request(
        &self,
        _ctx: &mut PipelineContext,
        request: Request,
    ) -> Result<BeforeRequest> {
        self.limiter.acquire(&request.backend).await?;
        Ok(BeforeRequest::Continue(request))
    }
}
