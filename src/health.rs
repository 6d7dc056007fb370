use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::types::Tier;

const UNAVAILABLE_ERR_RATE: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HealthStats {
    pub p50_ms: f32,
    pub p95_ms: f32,
    pub err_rate: f32,
    pub last_update: DateTime<Utc>,
    pub marked_down: bool,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self {
            p50_ms: 700.0,
            p95_ms: 2100.0,
            err_rate: 0.01,
            last_update: Utc::now(),
            marked_down: false,
        }
    }
}

/// Rolling per-tier health stats feeding the routing engine's availability
/// check. A single bad call never flips availability on its own: stats blend
/// via an exponentially weighted moving average.
#[derive(Clone)]
pub struct HealthStore {
    inner: Arc<DashMap<Tier, HealthStats>>,
}

impl Default for HealthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn snapshot(&self, tier: Tier) -> HealthStats {
        self.inner.get(&tier).map(|entry| entry.clone()).unwrap_or_default()
    }

    pub fn is_available(&self, tier: Tier) -> bool {
        let stats = self.snapshot(tier);
        !stats.marked_down && stats.err_rate < UNAVAILABLE_ERR_RATE
    }

    pub fn record_call(&self, tier: Tier, latency_ms: u64, success: bool) {
        let mut entry = self.inner.entry(tier).or_default();
        let alpha = 0.2_f32;
        let latency = latency_ms as f32;
        entry.p50_ms = blend(entry.p50_ms, latency, alpha);
        entry.p95_ms = blend(entry.p95_ms, latency * 1.3, alpha / 2.0);
        let err = if success { 0.0 } else { 1.0 };
        entry.err_rate = blend(entry.err_rate, err, 0.1);
        entry.last_update = Utc::now();
    }

    pub fn mark_down(&self, tier: Tier, down: bool) {
        let mut entry = self.inner.entry(tier).or_default();
        entry.marked_down = down;
        entry.last_update = Utc::now();
    }
}

fn blend(prev: f32, new: f32, alpha: f32) -> f32 {
    prev + (new - prev) * alpha.clamp(0.0, 1.0)
}
