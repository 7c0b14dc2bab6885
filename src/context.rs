//! Per-invocation pipeline context.
//!
//! A [`PipelineContext`] is created for every pipeline invocation and
//! discarded when it completes. It is the only place middleware may keep
//! state that belongs to one call (start instants, the model used for cost
//! attribution, a breaker permit). Shared middleware fields are never used
//! for this, so concurrent invocations cannot observe each other's values.

use serde_json::Value as JsonValue;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::traits::Request;

/// Timing record for one named stage of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    /// Stage name (middleware or backend).
    pub name: String,
    /// Time spent in the stage.
    pub elapsed: Duration,
}

/// Type-keyed storage for middleware-private per-invocation state.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|boxed| *boxed))
    }

    /// Get a reference to a value of type `T`.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    /// Get a mutable reference to a value of type `T`.
    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    /// Remove and return a value of type `T`.
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast::<T>().ok().map(|boxed| *boxed))
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if no values are stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Mutable state scoped to a single pipeline invocation.
#[derive(Debug)]
pub struct PipelineContext {
    correlation_id: Uuid,
    backend: String,
    model: String,
    started_at: Instant,
    cost_usd: f64,
    cache_hit: bool,
    /// Free-form metadata for logging and diagnostics.
    pub metadata: HashMap<String, JsonValue>,
    spans: Vec<SpanRecord>,
    extensions: Extensions,
}

impl PipelineContext {
    /// Create a context for the given request with a fresh correlation id.
    pub fn new(request: &Request) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            backend: request.backend.clone(),
            model: request.model.clone(),
            started_at: Instant::now(),
            cost_usd: 0.0,
            cache_hit: false,
            metadata: HashMap::new(),
            spans: Vec::new(),
            extensions: Extensions::default(),
        }
    }

    /// Correlation id shared by every log line of this invocation.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Backend the request is aimed at.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Model the request is aimed at.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Follow a request that was rewritten by a middleware.
    pub fn retarget(&mut self, request: &Request) {
        if self.backend != request.backend {
            self.backend = request.backend.clone();
        }
        if self.model != request.model {
            self.model = request.model.clone();
        }
    }

    /// Time since the invocation started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Add to the cost accrued by this invocation.
    pub fn add_cost(&mut self, usd: f64) {
        self.cost_usd += usd;
    }

    /// Cost accrued by this invocation in USD.
    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    /// Mark the response as served from the semantic cache.
    pub fn mark_cache_hit(&mut self) {
        self.cache_hit = true;
    }

    /// Whether the response was served from the semantic cache.
    pub fn is_cache_hit(&self) -> bool {
        self.cache_hit
    }

    /// Record the time spent in a named stage.
    pub fn record_span(&mut self, name: impl Into<String>, elapsed: Duration) {
        self.spans.push(SpanRecord {
            name: name.into(),
            elapsed,
        });
    }

    /// Stage timings recorded so far, in recording order.
    pub fn spans(&self) -> &[SpanRecord] {
        &self.spans
    }

    /// Middleware-private state.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Middleware-private state (mutable).
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}
