use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::types::CacheEntry;

/// Indexed set of `CacheEntry`, guarded by a single-writer lock. Reads and
/// writes both take the lock; under the entry counts this cache is sized
/// for, a full scan for cosine similarity is cheap enough that a lock-free
/// index would buy nothing worth the added complexity.
pub struct CacheStore {
    inner: RwLock<Inner>,
    max_entries: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
}

impl CacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_entries,
        }
    }

    /// Idempotent on `id`. Evicts the entry with the oldest `last_accessed`
    /// (ties broken by earliest `created_at`) when at capacity.
    pub fn add(&self, entry: CacheEntry) {
        let mut guard = self.inner.write();
        if !guard.entries.contains_key(&entry.id) && guard.entries.len() >= self.max_entries {
            if let Some(evict_id) = lru_candidate(&guard.entries) {
                guard.entries.remove(&evict_id);
            }
        }
        guard.entries.insert(entry.id.clone(), entry);
    }

    /// Top-k entries by cosine similarity (dot product on unit-normalized
    /// vectors) at or above `threshold`, filtered by exact `context_key`
    /// match when the caller supplies one. Expired entries are excluded and
    /// lazily removed.
    pub fn search_similar(
        &self,
        fingerprint: &[f32],
        context_key: Option<&str>,
        threshold: f32,
        k: usize,
    ) -> Vec<(CacheEntry, f32)> {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut scored = Vec::new();

        {
            let guard = self.inner.read();
            for entry in guard.entries.values() {
                if entry.expires_at <= now {
                    expired.push(entry.id.clone());
                    continue;
                }
                if let Some(key) = context_key {
                    if entry.context_key.as_deref() != Some(key) {
                        continue;
                    }
                }
                let score = dot(&entry.fingerprint, fingerprint);
                if score >= threshold {
                    scored.push((entry.clone(), score));
                }
            }
        }

        if !expired.is_empty() {
            let mut guard = self.inner.write();
            for id in expired {
                guard.entries.remove(&id);
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k.max(1));
        scored
    }

    /// Persists `hit_count`/`last_accessed` changes made by the caller.
    pub fn update(&self, entry: CacheEntry) {
        self.inner.write().entries.insert(entry.id.clone(), entry);
    }

    pub fn delete(&self, id: &str) -> bool {
        self.inner.write().entries.remove(id).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut guard = self.inner.write();
        let count = guard.entries.len();
        guard.entries.clear();
        count
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.write();
        let before = guard.entries.len();
        guard.entries.retain(|_, entry| entry.expires_at > now);
        before - guard.entries.len()
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.inner.read().entries.get(id).cloned()
    }
}

fn lru_candidate(entries: &HashMap<String, CacheEntry>) -> Option<String> {
    entries
        .values()
        .min_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| a.created_at.cmp(&b.created_at))
        })
        .map(|e| e.id.clone())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(id: &str, vector: Vec<f32>, created_offset_secs: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            id: id.into(),
            query_text: format!("query {id}"),
            fingerprint: vector,
            context_key: None,
            response: json!({"text": id}),
            tier_used: crate::types::Tier::Small,
            created_at: now + Duration::seconds(created_offset_secs),
            expires_at: now + Duration::hours(1),
            hit_count: 0,
            last_accessed: now + Duration::seconds(created_offset_secs),
            metadata: Default::default(),
        }
    }

    #[test]
    fn search_similar_respects_threshold() {
        let store = CacheStore::new(10);
        store.add(entry("a", vec![1.0, 0.0], 0));
        let hits = store.search_similar(&[1.0, 0.0], None, 0.85, 1);
        assert_eq!(hits.len(), 1);
        let hits = store.search_similar(&[0.0, 1.0], None, 0.85, 1);
        assert!(hits.is_empty());
    }

    #[test]
    fn context_key_filters_exact_match_only() {
        let store = CacheStore::new(10);
        let mut e = entry("a", vec![1.0, 0.0], 0);
        e.context_key = Some("file:a.rs".into());
        store.add(e);
        assert!(store
            .search_similar(&[1.0, 0.0], Some("file:b.rs"), 0.5, 1)
            .is_empty());
        assert_eq!(
            store.search_similar(&[1.0, 0.0], Some("file:a.rs"), 0.5, 1).len(),
            1
        );
    }

    #[test]
    fn capacity_evicts_oldest_last_accessed() {
        let store = CacheStore::new(2);
        store.add(entry("a", vec![1.0, 0.0], -10));
        store.add(entry("b", vec![0.0, 1.0], -5));
        store.add(entry("c", vec![0.0, 0.0], 0));
        assert_eq!(store.size(), 2);
        assert!(store.get("a").is_none());
    }

    #[test]
    fn expired_entries_are_excluded_and_lazily_removed() {
        let store = CacheStore::new(10);
        let mut e = entry("a", vec![1.0, 0.0], 0);
        e.expires_at = Utc::now() - Duration::seconds(1);
        store.add(e);
        assert!(store.search_similar(&[1.0, 0.0], None, 0.0, 1).is_empty());
        assert_eq!(store.size(), 0);
    }
}
