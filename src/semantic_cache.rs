use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache_store::CacheStore;
use crate::embedder::EmbeddingProvider;
use crate::types::{CacheEntry, CacheStatus, Tier};

const HIT_WINDOW: usize = 1000;
const EMBED_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

async fn embed_with_timeout(
    embedder: &dyn EmbeddingProvider,
    query: &str,
    context: Option<&Value>,
) -> anyhow::Result<crate::types::Fingerprint> {
    tokio::time::timeout(EMBED_TIMEOUT, embedder.embed(query, context))
        .await
        .map_err(|_| anyhow::anyhow!("embedding call timed out after {EMBED_TIMEOUT:?}"))?
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hit_rate: f32,
    pub hits: u64,
    pub misses: u64,
}

struct HitWindow {
    window: VecDeque<bool>,
    hits: u64,
    misses: u64,
}

impl HitWindow {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(HIT_WINDOW),
            hits: 0,
            misses: 0,
        }
    }

    fn record(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.window.push_back(hit);
        if self.window.len() > HIT_WINDOW {
            self.window.pop_front();
        }
    }

    fn hit_rate(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let hits = self.window.iter().filter(|h| **h).count();
        hits as f32 / self.window.len() as f32
    }
}

/// Similarity-addressed response cache. Looks a query up by embedding it,
/// scanning the store for neighbours above a configured threshold, and
/// tracks a trailing hit rate over the last [`HIT_WINDOW`] lookups. Can be
/// switched off entirely via `enabled`, in which case every lookup misses
/// and every store is a silent no-op.
pub struct SemanticCache {
    store: CacheStore,
    embedder: Arc<dyn EmbeddingProvider>,
    similarity_threshold: f32,
    ttl: Duration,
    window: Mutex<HitWindow>,
    enabled: bool,
}

impl SemanticCache {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        max_entries: usize,
        similarity_threshold: f32,
        ttl_hours: f64,
        enabled: bool,
    ) -> Self {
        Self {
            store: CacheStore::new(max_entries),
            embedder,
            similarity_threshold,
            ttl: Duration::milliseconds((ttl_hours * 3_600_000.0) as i64),
            window: Mutex::new(HitWindow::new()),
            enabled,
        }
    }

    /// Embeds `query`, searches for the closest entry above threshold, and
    /// on a hit bumps `hit_count`/`last_accessed`. Records the lookup in the
    /// rolling hit-rate window either way. Always misses when the cache is
    /// disabled.
    pub async fn lookup(
        &self,
        query: &str,
        context: Option<&Value>,
    ) -> anyhow::Result<Option<(CacheEntry, CacheStatus)>> {
        if !self.enabled {
            return Ok(None);
        }
        let fingerprint = embed_with_timeout(self.embedder.as_ref(), query, context).await?;
        let matches = self.store.search_similar(
            &fingerprint.vector,
            fingerprint.context_key.as_deref(),
            self.similarity_threshold,
            1,
        );

        let Some((mut entry, _score)) = matches.into_iter().next() else {
            self.window.lock().record(false);
            return Ok(None);
        };

        entry.hit_count += 1;
        entry.last_accessed = Utc::now();
        self.store.update(entry.clone());
        self.window.lock().record(true);
        Ok(Some((entry, CacheStatus::Hit)))
    }

    /// Embeds `query` and stores a new entry with the configured TTL.
    /// Returns `false` rather than an error when the cache is disabled or
    /// the embedding call fails — a write here is always best-effort and
    /// must never fail the request that triggered it.
    pub async fn store(
        &self,
        query_text: &str,
        response: Value,
        tier_used: Tier,
        context: Option<&Value>,
        metadata: Option<HashMap<String, Value>>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let fingerprint = match embed_with_timeout(self.embedder.as_ref(), query_text, context).await {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                tracing::warn!(error = %err, "semantic cache store: embedding failed, dropping write");
                return false;
            }
        };
        let now = Utc::now();
        let entry = CacheEntry {
            id: Uuid::new_v4().to_string(),
            query_text: query_text.to_string(),
            fingerprint: fingerprint.vector,
            context_key: fingerprint.context_key,
            response,
            tier_used,
            created_at: now,
            expires_at: now + self.ttl,
            hit_count: 0,
            last_accessed: now,
            metadata: metadata.unwrap_or_default(),
        };
        self.store.add(entry);
        true
    }

    /// Diagnostic surface: the top-k entries by similarity to `query_text`,
    /// regardless of threshold, without touching hit counts or the rolling
    /// hit-rate window. Returns an empty list when the cache is disabled.
    pub async fn search(&self, query_text: &str, k: usize) -> anyhow::Result<Vec<(CacheEntry, f32)>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let fingerprint = embed_with_timeout(self.embedder.as_ref(), query_text, None).await?;
        Ok(self
            .store
            .search_similar(&fingerprint.vector, fingerprint.context_key.as_deref(), 0.0, k))
    }

    /// Pre-populates the cache with known query/response pairs without
    /// going through the hit-rate window, for startup warmup. Returns the
    /// number of pairs actually stored.
    pub async fn warm(&self, seed: Vec<(String, Value, Tier)>) -> usize {
        let mut count = 0;
        for (query, response, tier) in seed {
            if self.store(&query, response, tier, None, None).await {
                count += 1;
            }
        }
        count
    }

    pub fn invalidate(&self, id: &str) -> bool {
        self.store.delete(id)
    }

    pub fn clear(&self) -> usize {
        self.store.clear()
    }

    pub fn cleanup_expired(&self) -> usize {
        self.store.cleanup_expired()
    }

    pub fn stats(&self) -> CacheStats {
        let window = self.window.lock();
        CacheStats {
            size: self.store.size(),
            hit_rate: window.hit_rate(),
            hits: window.hits,
            misses: window.misses,
        }
    }
}
