//! Embedding cache
//!
//! Embeddings are keyed by `(content hash, model id)`: identical text under
//! the same model reaches the provider once. The moka cache is the one shared
//! mutable resource of a run; a duplicate write stores an identical value.
//!
//! [`CachedEmbedder`] wraps any [`EmbeddingClient`] with the cache and
//! coalesces concurrent misses for the same key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kex_core::{content_hash, CacheSettings, KexError, Result};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::{EmbeddingClient, TaskType};

// ============================================================================
// Embedding Cache
// ============================================================================

/// Cache key: SHA-256 of the text plus the model that embedded it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingKey {
    pub content_hash: String,
    pub model_id: String,
}

impl EmbeddingKey {
    pub fn new(text: &str, model_id: &str) -> Self {
        Self {
            content_hash: content_hash(text),
            model_id: model_id.to_string(),
        }
    }
}

/// Concurrent cache of embedding vectors
#[derive(Clone)]
pub struct EmbeddingCache {
    cache: Cache<EmbeddingKey, Arc<Vec<f32>>>,
    stats: Arc<CacheStats>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::with_settings(&CacheSettings::default())
    }

    pub fn with_settings(settings: &CacheSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.embedding_max_capacity)
            .time_to_live(Duration::from_secs(settings.embedding_ttl_seconds))
            .build();

        Self {
            cache,
            stats: Arc::new(CacheStats::new("embedding")),
        }
    }

    pub async fn get(&self, key: &EmbeddingKey) -> Option<Arc<Vec<f32>>> {
        let result = self.cache.get(key).await;
        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    pub async fn put(&self, key: EmbeddingKey, embedding: Vec<f32>) {
        self.cache.insert(key, Arc::new(embedding)).await;
        self.stats.record_write();
    }

    /// Return the cached vector, or run `init` once for all concurrent callers
    pub async fn get_or_try_insert<F>(&self, key: EmbeddingKey, init: F) -> Result<Arc<Vec<f32>>>
    where
        F: std::future::Future<Output = Result<Vec<f32>>>,
    {
        let entry = self
            .cache
            .entry(key)
            .or_try_insert_with(async move { init.await.map(Arc::new) })
            .await
            .map_err(|e: Arc<KexError>| match e.as_ref() {
                KexError::Embedding(message) => KexError::Embedding(message.clone()),
                other => KexError::Embedding(other.to_string()),
            })?;

        if entry.is_fresh() {
            self.stats.record_miss();
            self.stats.record_write();
        } else {
            self.stats.record_hit();
        }
        Ok(entry.into_value())
    }

    pub async fn invalidate(&self, key: &EmbeddingKey) {
        self.cache.invalidate(key).await;
        self.stats.record_invalidation();
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Cached Embedder
// ============================================================================

/// [`EmbeddingClient`] that consults an [`EmbeddingCache`] first
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingClient>,
    cache: EmbeddingCache,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingClient>, cache: EmbeddingCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbedder {
    async fn embed(&self, text: &str, task: TaskType) -> Result<Vec<f32>> {
        let key = EmbeddingKey::new(text, self.inner.model_id());
        let inner = Arc::clone(&self.inner);
        let vector = self
            .cache
            .get_or_try_insert(key, async move { inner.embed(text, task).await })
            .await?;
        Ok(vector.as_ref().clone())
    }

    async fn embed_batch(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>> {
        let model_id = self.inner.model_id();
        let keys: Vec<EmbeddingKey> = texts.iter().map(|t| EmbeddingKey::new(t, model_id)).collect();

        let mut found: HashMap<&EmbeddingKey, Arc<Vec<f32>>> = HashMap::new();
        let mut missing: Vec<(&EmbeddingKey, &String)> = Vec::new();
        for (key, text) in keys.iter().zip(texts) {
            if found.contains_key(key) || missing.iter().any(|(k, _)| *k == key) {
                continue;
            }
            match self.cache.get(key).await {
                Some(vector) => {
                    found.insert(key, vector);
                }
                None => missing.push((key, text)),
            }
        }

        if !missing.is_empty() {
            debug!(
                model = model_id,
                requested = texts.len(),
                misses = missing.len(),
                "Embedding cache misses"
            );
            let batch: Vec<String> = missing.iter().map(|(_, t)| (*t).clone()).collect();
            let vectors = self.inner.embed_batch(&batch, task).await?;
            if vectors.len() != batch.len() {
                return Err(KexError::Embedding(format!(
                    "Expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            for ((key, _), vector) in missing.into_iter().zip(vectors) {
                let vector = Arc::new(vector);
                self.cache.cache.insert(key.clone(), Arc::clone(&vector)).await;
                self.cache.stats.record_write();
                found.insert(key, vector);
            }
        }

        keys.iter()
            .map(|key| {
                found
                    .get(key)
                    .map(|v| v.as_ref().clone())
                    .ok_or_else(|| KexError::Embedding("Embedding missing after batch".to_string()))
            })
            .collect()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

// ============================================================================
// Cache Statistics
// ============================================================================

/// Statistics for cache performance monitoring
#[derive(Debug)]
pub struct CacheStats {
    name: String,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    pub fn report(&self) -> CacheStatsReport {
        CacheStatsReport {
            name: self.name.clone(),
            hits: self.hits(),
            misses: self.misses(),
            writes: self.writes(),
            invalidations: self.invalidations(),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Serializable cache statistics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsReport {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

// ============================================================================
// Tests
// ============================================================================
