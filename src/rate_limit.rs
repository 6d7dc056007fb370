use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::Tier;

/// Per-key usage a rate limit decision needs: how many calls landed inside
/// the current window and when the window resets.
#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub count: u32,
    pub reset_at: Instant,
}

/// Storage seam for sliding-window counters, so a distributed backend
/// (shared Redis-like store) can later implement the same interface the
/// in-memory backend does.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn get_usage(&self, key: &str, window: Duration) -> Usage;
    async fn increment(&self, key: &str, window: Duration) -> Usage;
    async fn reset(&self, key: &str);
}

/// Sliding-window counter: timestamps of calls within the window are kept
/// per key and trimmed from the front as they age out, rather than a
/// token-bucket's continuous refill.
#[derive(Default)]
pub struct MemoryBackend {
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn trim(deque: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(front) = deque.front() {
            if now.duration_since(*front) > window {
                deque.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl RateLimitBackend for MemoryBackend {
    async fn get_usage(&self, key: &str, window: Duration) -> Usage {
        let now = Instant::now();
        let entry = self.windows.entry(key.to_string()).or_default();
        let mut deque = entry.lock();
        Self::trim(&mut deque, window, now);
        Usage {
            count: deque.len() as u32,
            reset_at: deque.front().map(|t| *t + window).unwrap_or(now + window),
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Usage {
        let now = Instant::now();
        let entry = self.windows.entry(key.to_string()).or_default();
        let mut deque = entry.lock();
        Self::trim(&mut deque, window, now);
        deque.push_back(now);
        Usage {
            count: deque.len() as u32,
            reset_at: deque.front().map(|t| *t + window).unwrap_or(now + window),
        }
    }

    async fn reset(&self, key: &str) {
        self.windows.remove(key);
    }
}

pub struct LimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub current: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

fn reset_secs(usage: &Usage) -> u64 {
    usage.reset_at.saturating_duration_since(Instant::now()).as_secs()
}

/// Sliding-window rate limiter over a pluggable [`RateLimitBackend`].
/// Limit resolution: an explicit per-key override beats a per-tier limit,
/// which beats `default_limit`.
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    window: Duration,
    default_limit: u32,
    key_limits: DashMap<String, u32>,
    tier_limits: DashMap<Tier, u32>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, window_secs: u64, default_limit: u32) -> Self {
        Self {
            backend,
            window: Duration::from_secs(window_secs),
            default_limit,
            key_limits: DashMap::new(),
            tier_limits: DashMap::new(),
        }
    }

    /// Sets an explicit override for one key (e.g. a client id), beating any
    /// per-tier limit.
    pub fn set_limit(&self, key: impl Into<String>, limit: u32) {
        self.key_limits.insert(key.into(), limit);
    }

    /// Sets the limit associated with a tier, used when a request carries a
    /// tier hint (its `preferred_tier`) and the key has no explicit override.
    pub fn set_tier_limit(&self, tier: Tier, limit: u32) {
        self.tier_limits.insert(tier, limit);
    }

    fn limit_for(&self, key: &str, tier: Option<Tier>) -> u32 {
        if let Some(limit) = self.key_limits.get(key) {
            return *limit;
        }
        if let Some(tier) = tier {
            if let Some(limit) = self.tier_limits.get(&tier) {
                return *limit;
            }
        }
        self.default_limit
    }

    /// Checks and consumes one unit of `key`'s budget for this call. `tier`
    /// is an optional hint (e.g. the request's `preferred_tier`) used to
    /// resolve a per-tier limit when the key has no explicit override.
    pub async fn check_with_tier(&self, key: &str, tier: Option<Tier>) -> LimitDecision {
        let limit = self.limit_for(key, tier);
        let usage = self.backend.get_usage(key, self.window).await;
        if usage.count >= limit {
            return LimitDecision {
                allowed: false,
                limit,
                current: usage.count,
                remaining: 0,
                retry_after_secs: reset_secs(&usage),
            };
        }
        let usage = self.backend.increment(key, self.window).await;
        LimitDecision {
            allowed: true,
            limit,
            current: usage.count,
            remaining: limit.saturating_sub(usage.count),
            retry_after_secs: reset_secs(&usage),
        }
    }

    /// Convenience form with no tier hint.
    pub async fn check(&self, key: &str) -> LimitDecision {
        self.check_with_tier(key, None).await
    }

    /// Remaining budget without consuming a unit, for status surfaces.
    pub async fn remaining(&self, key: &str) -> u32 {
        let limit = self.limit_for(key, None);
        let usage = self.backend.get_usage(key, self.window).await;
        limit.saturating_sub(usage.count)
    }

    /// `X-RateLimit-*` style headers for an HTTP response, surfaced on every
    /// response (not only on rejection) so clients can self-throttle.
    pub fn headers(decision: &LimitDecision) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", decision.limit.to_string()),
            ("X-RateLimit-Remaining", decision.remaining.to_string()),
            ("X-RateLimit-Reset", decision.retry_after_secs.to_string()),
        ]
    }

    pub async fn reset(&self, key: &str) {
        self.backend.reset(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryBackend::new()), 3600, limit)
    }

    #[tokio::test]
    async fn allows_calls_under_the_limit() {
        let limiter = limiter(3);
        for _ in 0..3 {
            assert!(limiter.check("client-a").await.allowed);
        }
    }

    #[tokio::test]
    async fn blocks_calls_over_the_limit() {
        let limiter = limiter(1);
        assert!(limiter.check("client-a").await.allowed);
        let decision = limiter.check("client-a").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn per_tier_limit_takes_precedence_over_default() {
        let limiter = limiter(1);
        limiter.set_tier_limit(crate::types::Tier::Large, 3);
        for _ in 0..3 {
            assert!(limiter.check_with_tier("client-a", Some(crate::types::Tier::Large)).await.allowed);
        }
        assert!(!limiter.check_with_tier("client-a", Some(crate::types::Tier::Large)).await.allowed);
    }

    #[tokio::test]
    async fn per_key_override_beats_per_tier_limit() {
        let limiter = limiter(1);
        limiter.set_tier_limit(crate::types::Tier::Large, 1);
        limiter.set_limit("client-a", 5);
        for _ in 0..5 {
            assert!(limiter.check_with_tier("client-a", Some(crate::types::Tier::Large)).await.allowed);
        }
        assert!(!limiter.check_with_tier("client-a", Some(crate::types::Tier::Large)).await.allowed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter(1);
        assert!(limiter.check("client-a").await.allowed);
        assert!(limiter.check("client-b").await.allowed);
    }

    #[tokio::test]
    async fn reset_clears_usage() {
        let limiter = limiter(1);
        assert!(limiter.check("client-a").await.allowed);
        assert!(!limiter.check("client-a").await.allowed);
        limiter.reset("client-a").await;
        assert!(limiter.check("client-a").await.allowed);
    }
}
