//! Cost tracking.
//!
//! [`CostTracker`] aggregates the cost of backend calls across concurrent
//! invocations. Pricing is always injected by the caller; there is no
//! built-in price table and unknown models accrue tokens at zero cost.
//!
//! [`CostTrackingMiddleware`] feeds the tracker from the pipeline. The model
//! used for pricing comes from the invocation's [`PipelineContext`], so two
//! concurrent calls to different models are each billed at their own rate.
//!
//! # Usage
//!
//! ```rust,ignore
//! use edgequake_pipeline::cost_tracker::{CostTracker, ModelPricing};
//!
//! let tracker = CostTracker::new()
//!     .with_pricing("gpt-4", ModelPricing::new(30.0, 60.0))
//!     .with_pricing("gpt-3.5", ModelPricing::new(0.5, 1.5));
//!
//! let cost = tracker.record_usage("gpt-3.5-turbo", "openai", 1000, 0, 0);
//! println!("{}", format_cost(cost));
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use crate::context::PipelineContext;
use crate::error::Result;
use crate::middleware::Middleware;
use crate::traits::Response;

/// Pricing information for a model.
///
/// Costs are specified in dollars per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per million input tokens (USD).
    pub input_cost_per_million: f64,

    /// Cost per million output tokens (USD).
    pub output_cost_per_million: f64,

    /// Cost per million cached input tokens (USD).
    /// If None, cached tokens are priced as regular input.
    #[serde(default)]
    pub cached_input_cost_per_million: Option<f64>,
}

impl ModelPricing {
    /// Create new pricing with input and output costs.
    pub fn new(input_cost_per_million: f64, output_cost_per_million: f64) -> Self {
        Self {
            input_cost_per_million,
            output_cost_per_million,
            cached_input_cost_per_million: None,
        }
    }

    /// Create pricing with a discounted cached-input rate.
    pub fn with_cache(
        input_cost_per_million: f64,
        output_cost_per_million: f64,
        cached_cost_per_million: f64,
    ) -> Self {
        Self {
            input_cost_per_million,
            output_cost_per_million,
            cached_input_cost_per_million: Some(cached_cost_per_million),
        }
    }

    /// Calculate cost for given token counts.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        self.calculate_cost_with_cache(input_tokens, 0, output_tokens)
    }

    /// Calculate cost when `cached_tokens` of the input were served from cache.
    pub fn calculate_cost_with_cache(
        &self,
        input_tokens: u64,
        cached_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let cached_tokens = cached_tokens.min(input_tokens);
        let uncached = input_tokens - cached_tokens;
        let cache_price = self
            .cached_input_cost_per_million
            .unwrap_or(self.input_cost_per_million);

        per_million(uncached, self.input_cost_per_million)
            + per_million(cached_tokens, cache_price)
            + per_million(output_tokens, self.output_cost_per_million)
    }
}

fn per_million(tokens: u64, price: f64) -> f64 {
    (tokens as f64 / 1_000_000.0) * price
}

/// A single cost entry for one backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    /// Model name.
    pub model: String,
    /// Backend name.
    pub backend: String,
    /// Input tokens used.
    pub input_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
    /// Cached input tokens.
    pub cached_tokens: u64,
    /// Calculated cost in USD.
    pub cost: f64,
    /// Whether pricing was known for the model.
    pub priced: bool,
    /// When the call was recorded.
    pub timestamp: SystemTime,
}

/// Summary of costs across all recorded calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    /// Total cost in USD.
    pub total_cost: f64,
    /// Total input tokens.
    pub total_input_tokens: u64,
    /// Total output tokens.
    pub total_output_tokens: u64,
    /// Total cached tokens.
    pub total_cached_tokens: u64,
    /// Number of recorded calls.
    pub call_count: usize,
    /// Calls whose model had no pricing.
    pub unpriced_calls: usize,
    /// Cost breakdown by model.
    pub by_model: HashMap<String, f64>,
    /// Cost breakdown by backend.
    pub by_backend: HashMap<String, f64>,
}

impl CostSummary {
    /// Average cost per call.
    pub fn avg_cost_per_call(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            self.total_cost / self.call_count as f64
        }
    }

    /// Fraction (0-1) of input tokens served from provider caches.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_input_tokens == 0 {
            0.0
        } else {
            self.total_cached_tokens as f64 / self.total_input_tokens as f64
        }
    }
}

impl fmt::Display for CostSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "calls={} cost={} tokens={}/{}",
            self.call_count,
            format_cost(self.total_cost),
            format_tokens(self.total_input_tokens),
            format_tokens(self.total_output_tokens)
        )
    }
}

/// Thread-safe cost tracker with injected pricing.
#[derive(Debug, Default)]
pub struct CostTracker {
    pricing: RwLock<HashMap<String, ModelPricing>>,
    entries: RwLock<Vec<CostEntry>>,
}

impl CostTracker {
    /// Create a tracker with no pricing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add pricing for a model (builder form).
    pub fn with_pricing(self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.set_pricing(model, pricing);
        self
    }

    /// Set pricing for a model key.
    pub fn set_pricing(&self, model: impl Into<String>, pricing: ModelPricing) {
        self.pricing.write().insert(model.into(), pricing);
    }

    /// Pricing for a model: exact key first, else the longest key that
    /// prefixes the model name (`gpt-3.5` prices `gpt-3.5-turbo`).
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        let pricing = self.pricing.read();
        if let Some(p) = pricing.get(model) {
            return Some(p.clone());
        }
        pricing
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, p)| p.clone())
    }

    /// Record usage for one call and return its cost.
    pub fn record_usage(
        &self,
        model: &str,
        backend: &str,
        input_tokens: u64,
        cached_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let pricing = self.pricing_for(model);
        let cost = pricing
            .as_ref()
            .map(|p| p.calculate_cost_with_cache(input_tokens, cached_tokens, output_tokens))
            .unwrap_or(0.0);

        if pricing.is_none() {
            debug!(model = %model, "No pricing configured, recording zero cost");
        }

        self.entries.write().push(CostEntry {
            model: model.to_string(),
            backend: backend.to_string(),
            input_tokens,
            output_tokens,
            cached_tokens,
            cost,
            priced: pricing.is_some(),
            timestamp: SystemTime::now(),
        });
        cost
    }

    /// Get total cost.
    pub fn total_cost(&self) -> f64 {
        self.entries.read().iter().map(|e| e.cost).sum()
    }

    /// Get number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<CostEntry> {
        self.entries.read().clone()
    }

    /// Clear all entries (pricing is kept).
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Get summary statistics.
    pub fn summary(&self) -> CostSummary {
        let entries = self.entries.read();
        let mut summary = CostSummary::default();

        for entry in entries.iter() {
            summary.total_cost += entry.cost;
            summary.total_input_tokens += entry.input_tokens;
            summary.total_output_tokens += entry.output_tokens;
            summary.total_cached_tokens += entry.cached_tokens;
            summary.call_count += 1;
            if !entry.priced {
                summary.unpriced_calls += 1;
            }
            *summary.by_model.entry(entry.model.clone()).or_default() += entry.cost;
            *summary.by_backend.entry(entry.backend.clone()).or_default() += entry.cost;
        }
        summary
    }
}

/// Format cost in a human-readable way.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${:.4}", cost)
    } else if cost < 1.0 {
        format!("${:.3}", cost)
    } else {
        format!("${:.2}", cost)
    }
}

/// Format token count compactly (1.5K, 2.0M).
pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        format!("{}", tokens)
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Records the cost of every backend-served response.
///
/// Responses served by the semantic cache cost nothing and are skipped.
pub struct CostTrackingMiddleware {
    tracker: Arc<CostTracker>,
}

impl CostTrackingMiddleware {
    /// Create a middleware feeding the given tracker.
    pub fn new(tracker: Arc<CostTracker>) -> Self {
        Self { tracker }
    }

    /// The underlying tracker.
    pub fn tracker(&self) -> &Arc<CostTracker> {
        &self.tracker
    }
}

#[async_trait]
impl Middleware for CostTrackingMiddleware {
    fn name(&self) -> &str {
        "cost_tracking"
    }

    async fn after_response(
        &self,
        ctx: &mut PipelineContext,
        response: Response,
    ) -> Result<Response> {
        if ctx.is_cache_hit() || response.is_cache_hit() {
            return Ok(response);
        }

        let usage = response.usage;
        let cost = self.tracker.record_usage(
            ctx.model(),
            ctx.backend(),
            usage.input_tokens,
            usage.cached_tokens,
            usage.output_tokens,
        );
        ctx.add_cost(cost);
        ctx.metadata.insert("cost_usd".to_string(), json!(ctx.cost_usd()));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::providers::MockBackend;
    use crate::traits::{Request, CACHE_HIT_METADATA_KEY};
    use std::time::Duration;

    #[test]
    fn test_calculate_cost() {
        let pricing = ModelPricing::new(15.0, 75.0);
        let cost = pricing.calculate_cost(1_000_000, 1_000_000);
        assert!((cost - 90.0).abs() < 0.001);
    }

    #[test]
    fn test_calculate_cost_small() {
        let pricing = ModelPricing::new(3.0, 15.0);
        // 1000/1M * 3.0 + 500/1M * 15.0 = 0.003 + 0.0075
        let cost = pricing.calculate_cost(1000, 500);
        assert!((cost - 0.0105).abs() < 0.0001);
    }

    #[test]
    fn test_calculate_cost_with_cache() {
        let pricing = ModelPricing::with_cache(15.0, 75.0, 1.5);
        // Uncached 200K * 15 + cached 800K * 1.5 + output 100K * 75
        let cost = pricing.calculate_cost_with_cache(1_000_000, 800_000, 100_000);
        assert!((cost - 11.7).abs() < 0.001);
    }

    #[test]
    fn test_cached_tokens_clamped_to_input() {
        let pricing = ModelPricing::with_cache(10.0, 0.0, 1.0);
        let cost = pricing.calculate_cost_with_cache(1_000_000, 5_000_000, 0);
        assert!((cost - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_pricing_lookup_prefers_longest_prefix() {
        let tracker = CostTracker::new()
            .with_pricing("gpt-4", ModelPricing::new(30.0, 60.0))
            .with_pricing("gpt-4o", ModelPricing::new(5.0, 15.0));

        assert_eq!(tracker.pricing_for("gpt-4").unwrap().input_cost_per_million, 30.0);
        assert_eq!(
            tracker.pricing_for("gpt-4o-mini").unwrap().input_cost_per_million,
            5.0
        );
        assert_eq!(
            tracker.pricing_for("gpt-4-turbo").unwrap().input_cost_per_million,
            30.0
        );
        assert!(tracker.pricing_for("claude-3-opus").is_none());
    }

    #[test]
    fn test_unknown_model_records_zero_cost() {
        let tracker = CostTracker::new();
        let cost = tracker.record_usage("mystery", "local", 1000, 0, 500);
        assert_eq!(cost, 0.0);

        let summary = tracker.summary();
        assert_eq!(summary.call_count, 1);
        assert_eq!(summary.unpriced_calls, 1);
        assert_eq!(summary.total_input_tokens, 1000);
        assert_eq!(summary.total_output_tokens, 500);
    }

    #[test]
    fn test_summary_breakdown() {
        let tracker = CostTracker::new()
            .with_pricing("gpt-4o", ModelPricing::new(2.5, 10.0))
            .with_pricing("claude", ModelPricing::new(3.0, 15.0));

        tracker.record_usage("gpt-4o", "openai", 1000, 0, 500);
        tracker.record_usage("gpt-4o", "openai", 2000, 0, 1000);
        tracker.record_usage("claude-sonnet", "anthropic", 1000, 0, 500);

        let summary = tracker.summary();
        assert_eq!(summary.call_count, 3);
        assert_eq!(summary.by_model.len(), 2);
        assert_eq!(summary.by_backend.len(), 2);
        assert!(summary.total_cost > 0.0);
        assert!((summary.avg_cost_per_call() - summary.total_cost / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_clear_keeps_pricing() {
        let tracker = CostTracker::new().with_pricing("m", ModelPricing::new(1.0, 1.0));
        tracker.record_usage("m", "b", 10, 0, 10);
        tracker.clear();
        assert_eq!(tracker.call_count(), 0);
        assert!(tracker.pricing_for("m").is_some());
    }

    #[test]
    fn test_format_cost_and_tokens() {
        assert_eq!(format_cost(0.001), "$0.0010");
        assert_eq!(format_cost(0.05), "$0.050");
        assert_eq!(format_cost(1.5), "$1.50");
        assert_eq!(format_tokens(500), "500");
        assert_eq!(format_tokens(1500), "1.5K");
        assert_eq!(format_tokens(1_500_000), "1.5M");
    }

    #[tokio::test]
    async fn test_middleware_records_cost_into_context() {
        let tracker = Arc::new(CostTracker::new().with_pricing("gpt-4", ModelPricing::new(30.0, 60.0)));
        let pipeline = Pipeline::new().with(Arc::new(CostTrackingMiddleware::new(tracker.clone())));

        let backend = MockBackend::new("openai");
        backend.add_full_response(Response::new("ok", "gpt-4").with_usage(1000, 0));

        let request = Request::from_prompt("openai", "gpt-4", "hi");
        let mut ctx = PipelineContext::new(&request);
        pipeline
            .execute_with_context(&backend, request, &mut ctx)
            .await
            .unwrap();

        assert!((ctx.cost_usd() - 0.03).abs() < 1e-9);
        assert!((tracker.total_cost() - 0.03).abs() < 1e-9);
        assert!(ctx.metadata.contains_key("cost_usd"));
    }

    #[tokio::test]
    async fn test_middleware_skips_cache_hits() {
        let tracker = Arc::new(CostTracker::new().with_pricing("gpt-4", ModelPricing::new(30.0, 60.0)));
        let pipeline = Pipeline::new().with(Arc::new(CostTrackingMiddleware::new(tracker.clone())));

        let backend = MockBackend::new("openai");
        backend.add_full_response(
            Response::new("ok", "gpt-4")
                .with_usage(1000, 0)
                .with_metadata(CACHE_HIT_METADATA_KEY, json!(true)),
        );
        pipeline
            .execute(&backend, Request::from_prompt("openai", "gpt-4", "hi"))
            .await
            .unwrap();
        assert_eq!(tracker.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_costs_attributed_per_invocation() {
        let tracker = Arc::new(
            CostTracker::new()
                .with_pricing("gpt-4", ModelPricing::new(30.0, 60.0))
                .with_pricing("gpt-3.5", ModelPricing::new(0.5, 1.5)),
        );
        let pipeline = Arc::new(
            Pipeline::new().with(Arc::new(CostTrackingMiddleware::new(tracker.clone()))),
        );

        // The expensive call starts first and finishes last.
        let slow = MockBackend::new("openai").with_latency(Duration::from_millis(200));
        slow.add_full_response(Response::new("a", "").with_usage(1000, 0));
        let fast = MockBackend::new("openai").with_latency(Duration::from_millis(50));
        fast.add_full_response(Response::new("b", "").with_usage(1000, 0));

        let (a, b) = tokio::join!(
            pipeline.execute(&slow, Request::from_prompt("openai", "gpt-4", "a")),
            pipeline.execute(&fast, Request::from_prompt("openai", "gpt-3.5-turbo", "b")),
        );
        a.unwrap();
        b.unwrap();

        assert!((tracker.total_cost() - 0.0305).abs() < 1e-9);
        let summary = tracker.summary();
        assert!((summary.by_model["gpt-4"] - 0.03).abs() < 1e-9);
        assert!((summary.by_model["gpt-3.5-turbo"] - 0.0005).abs() < 1e-9);
    }
}
