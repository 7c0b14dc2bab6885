//! Semantic response cache.
//!
//! Responses are keyed by the embedding of the normalized prompt (text of
//! the last user message, whitespace collapsed). A lookup returns the stored
//! response whose prompt embedding is most cosine-similar to the query,
//! provided the score reaches the configured threshold.
//!
//! ## Rules
//!
//! - Entries are partitioned by scope: the model, plus a fingerprint of the
//!   rest of the request that shapes the answer (earlier messages, image
//!   parts, tool definitions, response schema). A response is never served
//!   for a different model or context.
//! - Re-inserting the same normalized prompt replaces the previous entry.
//! - Expired entries (optional TTL) are purged on access; when a partition
//!   is full the oldest entry is evicted first.
//! - Zero vectors and dimension mismatches score 0.
//! - Embedding failures degrade to a cache bypass, never a request failure.
//! - Only conversations ending with a user message are cached, so agent
//!   transcripts (ending with tool results) always reach the backend.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::middleware::{BeforeRequest, Middleware};
use crate::traits::{ContentPart, Embedder, Request, Response, Role, CACHE_HIT_METADATA_KEY};

/// Metadata key carrying the similarity score of a cache hit.
pub const CACHE_SIMILARITY_METADATA_KEY: &str = "cache_similarity";

/// Configuration for the semantic cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemanticCacheConfig {
    /// Minimum cosine similarity for a hit (0.0 - 1.0).
    pub threshold: f32,
    /// Maximum number of entries per scope.
    pub max_entries: usize,
    /// Time-to-live for entries. `None` keeps entries until evicted.
    pub ttl: Option<Duration>,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            max_entries: 1000,
            ttl: None,
        }
    }
}

impl SemanticCacheConfig {
    /// Set the similarity threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the maximum number of entries per scope.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the TTL for entries.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(PipelineError::Config(format!(
                "semantic_cache.threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.max_entries == 0 {
            return Err(PipelineError::Config(
                "semantic_cache.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cosine similarity of two vectors; 0 for zero vectors or mismatched lengths.
///
/// Accumulates in f64 and clamps to [-1, 1], so a vector scores exactly 1.0
/// against itself.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |acc, (&x, &y)| {
        let (x, y) = (f64::from(x), f64::from(y));
        (acc.0 + x * y, acc.1 + x * x, acc.2 + y * y)
    });
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b).sqrt()).clamp(-1.0, 1.0) as f32
}

fn prompt_hash(prompt: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    prompt.hash(&mut hasher);
    hasher.finish()
}

/// One stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Embedding of the normalized prompt.
    pub embedding: Vec<f32>,
    /// Scope the entry is stored under (see [`SemanticCache::scope`]).
    pub scope: String,
    /// Hash of the normalized prompt text.
    pub prompt_hash: u64,
    /// The stored response.
    pub response: Response,
    /// When the entry was inserted.
    pub inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.map(|ttl| self.inserted_at.elapsed() > ttl)
            .unwrap_or(false)
    }
}

/// Semantic cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries removed by TTL or capacity.
    pub evictions: u64,
    /// Lookups skipped because embedding failed.
    pub bypasses: u64,
    /// Current number of entries (all models).
    pub entries: usize,
}

impl CacheStats {
    /// Get the cache hit rate (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type Partition = Arc<RwLock<VecDeque<CacheEntry>>>;

/// In-memory semantic cache.
pub struct SemanticCache {
    config: SemanticCacheConfig,
    embedder: Arc<dyn Embedder>,
    partitions: RwLock<HashMap<String, Partition>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bypasses: AtomicU64,
}

impl SemanticCache {
    /// Create a cache using `embedder` for prompts without a precomputed
    /// embedding.
    pub fn new(config: SemanticCacheConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            partitions: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SemanticCacheConfig {
        &self.config
    }

    fn partition(&self, scope: &str) -> Partition {
        if let Some(partition) = self.partitions.read().get(scope) {
            return partition.clone();
        }
        self.partitions
            .write()
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(VecDeque::new())))
            .clone()
    }

    fn existing_partition(&self, scope: &str) -> Option<Partition> {
        self.partitions.read().get(scope).cloned()
    }

    /// Whether the request is eligible for caching.
    pub fn is_cacheable(request: &Request) -> bool {
        request
            .messages
            .last()
            .map(|m| m.role == Role::User)
            .unwrap_or(false)
    }

    /// Partition key for a request, `None` when it is not cacheable.
    ///
    /// A bare single-turn prompt is scoped by its model alone. Anything else
    /// that changes the answer (earlier messages, image parts of the prompt,
    /// tool definitions, a response schema) is hashed into the scope, so
    /// only requests with the same context share entries.
    pub fn scope(request: &Request) -> Option<String> {
        let (last, history) = request.messages.split_last()?;
        if last.role != Role::User {
            return None;
        }
        let attachments: Vec<&ContentPart> = last
            .content
            .iter()
            .filter(|part| !matches!(part, ContentPart::Text { .. }))
            .collect();
        if history.is_empty()
            && attachments.is_empty()
            && request.tools.is_empty()
            && request.response_schema.is_none()
        {
            return Some(request.model.clone());
        }

        let context = serde_json::to_string(&(
            history,
            &attachments,
            &request.tools,
            &request.response_schema,
        ))
        .ok()?;
        Some(format!("{}#{:016x}", request.model, prompt_hash(&context)))
    }

    /// Normalized prompt text and its embedding.
    ///
    /// Uses the request's precomputed embedding when present. Returns `None`
    /// when the request has no user text or embedding failed.
    pub async fn embed_prompt(&self, request: &Request) -> Option<(String, Vec<f32>)> {
        let prompt = request.normalized_prompt()?;
        if let Some(embedding) = &request.prompt_embedding {
            return Some((prompt, embedding.clone()));
        }
        match self.embedder.embed_one(&prompt).await {
            Ok(embedding) => Some((prompt, embedding)),
            Err(e) => {
                self.bypasses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    embedder = self.embedder.name(),
                    error = %e,
                    "Embedding failed, bypassing semantic cache"
                );
                None
            }
        }
    }

    fn purge_expired(&self, entries: &mut VecDeque<CacheEntry>) {
        // Insertion order is also expiry order.
        while entries
            .front()
            .map(|e| e.is_expired(self.config.ttl))
            .unwrap_or(false)
        {
            entries.pop_front();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Best stored response in `scope` with similarity ≥ threshold.
    ///
    /// The returned response carries `cache_hit = true` metadata.
    pub fn lookup(&self, scope: &str, embedding: &[f32]) -> Option<Response> {
        let Some(partition) = self.existing_partition(scope) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let has_expired = partition
            .read()
            .front()
            .map(|e| e.is_expired(self.config.ttl))
            .unwrap_or(false);
        if has_expired {
            self.purge_expired(&mut partition.write());
        }

        let best = {
            let entries = partition.read();
            entries
                .iter()
                .map(|entry| (cosine_similarity(embedding, &entry.embedding), entry))
                .filter(|(score, _)| *score >= self.config.threshold)
                .max_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(score, entry)| (score, entry.response.clone()))
        };

        match best {
            Some((score, response)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(scope = %scope, similarity = score, "Semantic cache hit");
                Some(
                    response
                        .with_metadata(CACHE_HIT_METADATA_KEY, json!(true))
                        .with_metadata(CACHE_SIMILARITY_METADATA_KEY, json!(score)),
                )
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response for `(scope, prompt)`.
    pub fn insert(&self, scope: &str, prompt: &str, embedding: Vec<f32>, response: Response) {
        let entry = CacheEntry {
            embedding,
            scope: scope.to_string(),
            prompt_hash: prompt_hash(prompt),
            response,
            inserted_at: Instant::now(),
        };

        let partition = self.partition(scope);
        let mut entries = partition.write();
        self.purge_expired(&mut entries);
        entries.retain(|e| e.prompt_hash != entry.prompt_hash);
        while entries.len() >= self.config.max_entries {
            entries.pop_front();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
    }

    /// Look up a request (embedding its prompt as needed).
    pub async fn get(&self, request: &Request) -> Option<Response> {
        let scope = Self::scope(request)?;
        let (_, embedding) = self.embed_prompt(request).await?;
        self.lookup(&scope, &embedding)
    }

    /// Store the response for a request (embedding its prompt as needed).
    pub async fn put(&self, request: &Request, response: Response) {
        let Some(scope) = Self::scope(request) else {
            return;
        };
        if let Some((prompt, embedding)) = self.embed_prompt(request).await {
            self.insert(&scope, &prompt, embedding, response);
        }
    }

    /// Number of stored entries (all models).
    pub fn len(&self) -> usize {
        self.partitions
            .read()
            .values()
            .map(|p| p.read().len())
            .sum()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&self) {
        self.partitions.write().clear();
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Prompt embedded on the way in, inserted on the way out.
struct PendingInsert {
    scope: String,
    prompt: String,
    embedding: Vec<f32>,
}

/// Serves similar prompts from the [`SemanticCache`] and stores new
/// responses.
pub struct SemanticCacheMiddleware {
    cache: Arc<SemanticCache>,
}

impl SemanticCacheMiddleware {
    /// Wrap a shared cache.
    pub fn new(cache: Arc<SemanticCache>) -> Self {
        Self { cache }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }
}

#[async_trait]
impl Middleware for SemanticCacheMiddleware {
    fn name(&self) -> &str {
        "semantic_cache"
    }

    async fn before_request(
        &self,
        ctx: &mut PipelineContext,
        request: Request,
    ) -> Result<BeforeRequest> {
        let Some(scope) = SemanticCache::scope(&request) else {
            return Ok(BeforeRequest::Continue(request));
        };
        let Some((prompt, embedding)) = self.cache.embed_prompt(&request).await else {
            return Ok(BeforeRequest::Continue(request));
        };

        if let Some(hit) = self.cache.lookup(&scope, &embedding) {
            ctx.mark_cache_hit();
            return Ok(BeforeRequest::ShortCircuit(hit));
        }

        ctx.extensions_mut().insert(PendingInsert {
            scope,
            prompt,
            embedding,
        });
        Ok(BeforeRequest::Continue(request))
    }

    async fn after_response(
        &self,
        ctx: &mut PipelineContext,
        response: Response,
    ) -> Result<Response> {
        if let Some(pending) = ctx.extensions_mut().remove::<PendingInsert>() {
            if !response.is_cache_hit() && !response.has_tool_calls() {
                self.cache.insert(
                    &pending.scope,
                    &pending.prompt,
                    pending.embedding,
                    response.clone(),
                );
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::middleware::Pipeline;
    use crate::providers::{MockBackend, MockEmbedder};
    use crate::traits::Message;

    fn cache_with(config: SemanticCacheConfig, embedder: MockEmbedder) -> Arc<SemanticCache> {
        Arc::new(SemanticCache::new(config, Arc::new(embedder)))
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_identical_vectors_hit_at_threshold_one() {
        let v = vec![0.1, 0.2, 0.3, 0.7, 0.11];
        assert_eq!(cosine_similarity(&v, &v), 1.0);

        let cache = cache_with(
            SemanticCacheConfig::default().with_threshold(1.0),
            MockEmbedder::new(5),
        );
        cache.insert("m", "q", v.clone(), Response::new("exact", "m"));
        assert_eq!(cache.lookup("m", &v).unwrap().text, "exact");
        assert!(cache.lookup("m", &[0.1, 0.2, 0.3, 0.7, 0.12]).is_none());
    }

    #[test]
    fn test_scope_covers_request_context() {
        let plain = Request::from_prompt("b", "m", "summarize");
        assert_eq!(SemanticCache::scope(&plain).as_deref(), Some("m"));

        let schema = plain
            .clone()
            .with_response_schema("out", serde_json::json!({"type": "object"}));
        let system = Request::new(
            "b",
            "m",
            vec![Message::system("Answer in French"), Message::user("summarize")],
        );
        let scopes = [
            SemanticCache::scope(&schema).unwrap(),
            SemanticCache::scope(&system).unwrap(),
        ];
        assert!(scopes.iter().all(|s| s != "m" && s.starts_with("m#")));
        assert_ne!(scopes[0], scopes[1]);
        assert_eq!(SemanticCache::scope(&schema.clone()), SemanticCache::scope(&schema));

        let tool_turn = Request::new(
            "b",
            "m",
            vec![Message::user("q"), Message::tool_result("c1", "42", false)],
        );
        assert!(SemanticCache::scope(&tool_turn).is_none());
    }

    #[tokio::test]
    async fn test_middleware_separates_schema_constrained_prompts() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::new(64));
        let pipeline = Pipeline::new().with(Arc::new(SemanticCacheMiddleware::new(cache.clone())));
        let backend = MockBackend::new("b");
        backend.add_response("plain prose answer");
        backend.add_response(r#"{"summary": "short"}"#);

        let plain = Request::from_prompt("b", "m", "summarize");
        let structured = plain
            .clone()
            .with_response_schema("out", serde_json::json!({"type": "object"}));

        pipeline.execute(&backend, plain.clone()).await.unwrap();
        let first = pipeline.execute(&backend, structured.clone()).await.unwrap();
        assert!(!first.is_cache_hit());
        assert_eq!(first.text, r#"{"summary": "short"}"#);

        let again = pipeline.execute(&backend, structured).await.unwrap();
        assert!(again.is_cache_hit());
        assert_eq!(again.text, r#"{"summary": "short"}"#);
        let plain_again = pipeline.execute(&backend, plain).await.unwrap();
        assert_eq!(plain_again.text, "plain prose answer");
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(SemanticCacheConfig::default().validate().is_ok());
        assert!(SemanticCacheConfig::default()
            .with_threshold(1.5)
            .validate()
            .is_err());
        assert!(SemanticCacheConfig::default()
            .with_max_entries(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_lookup_threshold_and_model_partition() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::new(4));
        cache.insert("m1", "hello", vec![1.0, 0.0, 0.0, 0.0], Response::new("hi", "m1"));

        let hit = cache.lookup("m1", &[0.99, 0.05, 0.0, 0.0]).unwrap();
        assert_eq!(hit.text, "hi");
        assert!(hit.is_cache_hit());

        assert!(cache.lookup("m1", &[0.5, 0.5, 0.5, 0.5]).is_none());
        assert!(cache.lookup("m2", &[1.0, 0.0, 0.0, 0.0]).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_returns_most_similar() {
        let cache = cache_with(
            SemanticCacheConfig::default().with_threshold(0.5),
            MockEmbedder::new(2),
        );
        cache.insert("m", "a", vec![1.0, 0.2], Response::new("close", "m"));
        cache.insert("m", "b", vec![1.0, 0.9], Response::new("far", "m"));
        let hit = cache.lookup("m", &[1.0, 0.1]).unwrap();
        assert_eq!(hit.text, "close");
    }

    #[test]
    fn test_reinsert_same_prompt_replaces_entry() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::new(2));
        cache.insert("m", "q", vec![1.0, 0.0], Response::new("old", "m"));
        cache.insert("m", "q", vec![1.0, 0.0], Response::new("new", "m"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("m", &[1.0, 0.0]).unwrap().text, "new");
    }

    #[test]
    fn test_oldest_entry_evicted_first() {
        let cache = cache_with(
            SemanticCacheConfig::default().with_max_entries(2),
            MockEmbedder::new(3),
        );
        cache.insert("m", "a", vec![1.0, 0.0, 0.0], Response::new("a", "m"));
        cache.insert("m", "b", vec![0.0, 1.0, 0.0], Response::new("b", "m"));
        cache.insert("m", "c", vec![0.0, 0.0, 1.0], Response::new("c", "m"));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("m", &[1.0, 0.0, 0.0]).is_none());
        assert!(cache.lookup("m", &[0.0, 1.0, 0.0]).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_purges_on_access() {
        let cache = cache_with(
            SemanticCacheConfig::default().with_ttl(Duration::from_secs(10)),
            MockEmbedder::new(2),
        );
        cache.insert("m", "q", vec![1.0, 0.0], Response::new("r", "m"));
        assert!(cache.lookup("m", &[1.0, 0.0]).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.lookup("m", &[1.0, 0.0]).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_get_put_with_embedder() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::new(64));
        let request = Request::from_prompt("b", "m", "What is the capital of France?");
        assert!(cache.get(&request).await.is_none());

        cache.put(&request, Response::new("Paris", "m")).await;
        let similar = Request::from_prompt("b", "m", "what is the capital of   france");
        assert_eq!(cache.get(&similar).await.unwrap().text, "Paris");
    }

    #[tokio::test]
    async fn test_precomputed_embedding_skips_embedder() {
        let embedder = MockEmbedder::new(2);
        let cache = Arc::new(SemanticCache::new(
            SemanticCacheConfig::default(),
            Arc::new(embedder.clone()),
        ));
        let request = Request::from_prompt("b", "m", "q").with_prompt_embedding(vec![0.0, 1.0]);
        cache.put(&request, Response::new("r", "m")).await;
        assert!(cache.get(&request).await.is_some());
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_bypasses() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::failing(4));
        let request = Request::from_prompt("b", "m", "q");
        assert!(cache.get(&request).await.is_none());
        cache.put(&request, Response::new("r", "m")).await;
        assert!(cache.is_empty());
        assert_eq!(cache.stats().bypasses, 2);
    }

    #[tokio::test]
    async fn test_middleware_hit_bypasses_backend() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::new(64));
        let pipeline = Pipeline::new().with(Arc::new(SemanticCacheMiddleware::new(cache.clone())));
        let backend = MockBackend::new("b");
        backend.add_response("Paris");

        let request = Request::from_prompt("b", "m", "Capital of France?");
        let first = pipeline.execute(&backend, request.clone()).await.unwrap();
        assert!(!first.is_cache_hit());

        let mut ctx = PipelineContext::new(&request);
        let second = pipeline
            .execute_with_context(&backend, request, &mut ctx)
            .await
            .unwrap();
        assert_eq!(second.text, "Paris");
        assert!(second.is_cache_hit());
        assert!(ctx.is_cache_hit());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_middleware_embedding_failure_reaches_backend() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::failing(4));
        let pipeline = Pipeline::new().with(Arc::new(SemanticCacheMiddleware::new(cache)));
        let backend = MockBackend::new("b");
        let response = pipeline
            .execute(&backend, Request::from_prompt("b", "m", "q"))
            .await
            .unwrap();
        assert_eq!(response.text, "Mock response");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_middleware_does_not_cache_failures_or_tool_turns() {
        let cache = cache_with(SemanticCacheConfig::default(), MockEmbedder::new(16));
        let pipeline = Pipeline::new().with(Arc::new(SemanticCacheMiddleware::new(cache.clone())));

        let failing = MockBackend::failing("b", FailureKind::Unavailable);
        let request = Request::from_prompt("b", "m", "q");
        assert!(pipeline.execute(&failing, request).await.is_err());
        assert!(cache.is_empty());

        let backend = MockBackend::new("b");
        let tool_turn = Request::new(
            "b",
            "m",
            vec![Message::user("q"), Message::tool_result("c1", "42", false)],
        );
        pipeline.execute(&backend, tool_turn).await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_and_lookups() {
        let cache = cache_with(
            SemanticCacheConfig::default().with_max_entries(50),
            MockEmbedder::new(8),
        );
        let mut handles = Vec::new();
        for i in 0..20u32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let v = vec![i as f32 + 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
                cache.insert("m", &format!("p{}", i), v.clone(), Response::new("r", "m"));
                cache.lookup("m", &v).is_some()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(cache.len(), 20);
    }
}
