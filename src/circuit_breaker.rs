//! Per-backend circuit breaker.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────► Open
//!     ▲                                 │ recovery_timeout elapsed
//!     │ probe ok                        ▼ (checked at admission)
//!     └──────────────────────────── HalfOpen ──► Open (probe failed)
//! ```
//!
//! Each backend key has its own state behind its own lock. In `HalfOpen`
//! exactly one probe is admitted; concurrent callers fail fast with
//! [`PipelineError::CircuitOpen`].
//!
//! Admission hands out a [`BreakerPermit`]. Recording an outcome consumes
//! the permit. A permit dropped without an outcome (cancelled invocation)
//! frees the probe slot and changes nothing else.
//!
//! Only backend-originated failures (`Throttled`, `BackendUnavailable`,
//! `Timeout`) count toward the threshold.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::middleware::{BeforeRequest, Middleware};
use crate::traits::{Request, Response};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls are rejected without a network attempt.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(PipelineError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    /// Stored state (an expired `Open` turns `HalfOpen` at the next admission).
    pub state: CircuitState,
    /// Consecutive counted failures.
    pub consecutive_failures: u32,
    /// When the last counted failure happened.
    pub last_failure: Option<Instant>,
    /// When the circuit last opened.
    pub opened_at: Option<Instant>,
    /// Whether a half-open probe is running.
    pub probe_in_flight: bool,
}

/// Circuit breaker keyed by backend.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<Circuit>>>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, key: &str) -> Arc<Mutex<Circuit>> {
        if let Some(circuit) = self.circuits.read().get(key) {
            return circuit.clone();
        }
        self.circuits
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new())))
            .clone()
    }

    /// Ask to call `key`.
    ///
    /// Returns `CircuitOpen` while the circuit is open, or while another
    /// half-open probe is in flight.
    pub fn try_acquire(&self, key: &str) -> Result<BreakerPermit> {
        let circuit = self.circuit(key);
        let probe = {
            let mut c = circuit.lock();
            if c.state == CircuitState::Open {
                let expired = c
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if !expired {
                    return Err(PipelineError::CircuitOpen {
                        backend: key.to_string(),
                    });
                }
                c.state = CircuitState::HalfOpen;
                info!(backend = %key, "Circuit half-open, admitting probe");
            }

            match c.state {
                CircuitState::Closed => false,
                CircuitState::HalfOpen if !c.probe_in_flight => {
                    c.probe_in_flight = true;
                    true
                }
                _ => {
                    debug!(backend = %key, "Probe already in flight, rejecting");
                    return Err(PipelineError::CircuitOpen {
                        backend: key.to_string(),
                    });
                }
            }
        };

        Ok(BreakerPermit {
            key: key.to_string(),
            circuit,
            threshold: self.config.failure_threshold,
            probe,
            settled: false,
        })
    }

    /// Stored state of `key` (Closed for unknown keys).
    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .read()
            .get(key)
            .map(|c| c.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Diagnostic snapshot of `key`.
    pub fn snapshot(&self, key: &str) -> CircuitSnapshot {
        let circuit = self.circuit(key);
        let c = circuit.lock();
        CircuitSnapshot {
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            last_failure: c.last_failure,
            opened_at: c.opened_at,
            probe_in_flight: c.probe_in_flight,
        }
    }

    /// Force `key` back to Closed.
    pub fn reset(&self, key: &str) {
        if let Some(circuit) = self.circuits.read().get(key) {
            let mut c = circuit.lock();
            c.close();
            c.last_failure = None;
            c.probe_in_flight = false;
        }
    }

    /// Keys with recorded state.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.circuits.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Admission ticket for one call.
///
/// Consume it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unrecorded releases
/// a held probe slot.
#[derive(Debug)]
pub struct BreakerPermit {
    key: String,
    circuit: Arc<Mutex<Circuit>>,
    threshold: u32,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Backend key this permit admits.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a successful call.
    pub fn record_success(mut self) {
        self.settled = true;
        let mut c = self.circuit.lock();
        match c.state {
            CircuitState::Closed => c.consecutive_failures = 0,
            CircuitState::HalfOpen if self.probe => {
                c.close();
                info!(backend = %self.key, "Probe succeeded, circuit closed");
            }
            _ => {}
        }
        if self.probe {
            c.probe_in_flight = false;
        }
    }

    /// Record a failed call. Errors that do not count only free the probe.
    pub fn record_failure(mut self, error: &PipelineError) {
        self.settled = true;
        let mut c = self.circuit.lock();
        if self.probe {
            c.probe_in_flight = false;
        }
        if !error.counts_toward_breaker() {
            return;
        }

        let now = Instant::now();
        c.consecutive_failures = c.consecutive_failures.saturating_add(1);
        c.last_failure = Some(now);
        match c.state {
            CircuitState::Closed if c.consecutive_failures >= self.threshold => {
                c.open(now);
                warn!(
                    backend = %self.key,
                    failures = c.consecutive_failures,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen if self.probe => {
                c.open(now);
                warn!(backend = %self.key, error = %error, "Probe failed, circuit reopened");
            }
            _ => {}
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.circuit.lock().probe_in_flight = false;
            debug!(backend = %self.key, "Probe permit dropped unrecorded");
        }
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// The breaker as a pipeline stage for single-backend pipelines.
///
/// Place it inside (after) a [`crate::rate_limiter::RateLimiterMiddleware`]
/// so local throttling is never counted as a backend failure. Do not add it
/// to a pipeline driven by [`crate::fallback::FallbackRouter`], which already
/// gates every attempt on the breaker.
pub struct CircuitBreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerMiddleware {
    /// Wrap a shared breaker.
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn before_request(
        &self,
        ctx: &mut PipelineContext,
        request: Request,
    ) -> Result<BeforeRequest> {
        let permit = self.breaker.try_acquire(&request.backend)?;
        ctx.extensions_mut().insert(permit);
        Ok(BeforeRequest::Continue(request))
    }

    async fn after_response(
        &self,
        ctx: &mut PipelineContext,
        response: Response,
    ) -> Result<Response> {
        if let Some(permit) = ctx.extensions_mut().remove::<BreakerPermit>() {
            permit.record_success();
        }
        Ok(response)
    }

    async fn on_error(&self, ctx: &mut PipelineContext, error: &PipelineError) -> Option<Response> {
        if let Some(permit) = ctx.extensions_mut().remove::<BreakerPermit>() {
            permit.record_failure(error);
        }
        None
    }
}
