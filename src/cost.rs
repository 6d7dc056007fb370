use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::MetricsRegistry;
use crate::types::{CostPeriod, CostSummary, Tier, TierConfig, UsageRecord};

const LEDGER_CHANNEL_CAPACITY: usize = 4096;
/// How long `record()` will wait for channel space before giving up and
/// dropping the record rather than blocking the request path.
const LEDGER_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(50);
/// Baseline tier a request would have used absent routing, for computing
/// routing savings: everything would otherwise go to the most expensive tier.
const BASELINE_TIER: Tier = Tier::Large;

fn period_duration(period: CostPeriod) -> Duration {
    match period {
        CostPeriod::Hourly => Duration::hours(1),
        CostPeriod::Daily => Duration::days(1),
        CostPeriod::Weekly => Duration::weeks(1),
        CostPeriod::Monthly => Duration::days(30),
    }
}

#[derive(Default)]
pub struct CostCalculator;

impl CostCalculator {
    pub fn calculate(tier_config: &TierConfig, input_tokens: u32, output_tokens: u32) -> f64 {
        let input_cost = (input_tokens as f64 / 1000.0) * tier_config.price_per_1k_in;
        let output_cost = (output_tokens as f64 / 1000.0) * tier_config.price_per_1k_out;
        input_cost + output_cost
    }
}

/// Background-drained ledger of `UsageRecord`s. `record()` is non-blocking:
/// it pushes onto a bounded channel and a single background task folds
/// entries into the in-memory ring buffer, so a burst of requests never
/// blocks the request path on ledger bookkeeping.
pub struct CostLedger {
    sender: mpsc::Sender<UsageRecord>,
    records: std::sync::Arc<RwLock<VecDeque<UsageRecord>>>,
    max_records: usize,
    metrics: RwLock<Option<Arc<MetricsRegistry>>>,
}

impl CostLedger {
    /// Spawns the background writer task. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(max_records: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel(LEDGER_CHANNEL_CAPACITY);
        let records = std::sync::Arc::new(RwLock::new(VecDeque::with_capacity(max_records)));
        let worker_records = records.clone();

        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                let mut guard = worker_records.write();
                if guard.len() >= max_records {
                    guard.pop_front();
                }
                guard.push_back(record);
            }
            tracing::info!("cost ledger writer task shut down");
        });

        Self {
            sender,
            records,
            max_records,
            metrics: RwLock::new(None),
        }
    }

    /// Attaches a metrics registry so a record dropped under backpressure
    /// can be counted. Optional: a ledger constructed without one still
    /// drops records on a full channel, just without a corresponding metric.
    pub fn attach_metrics(&self, metrics: Arc<MetricsRegistry>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Enqueues a usage record. Waits up to `LEDGER_SEND_TIMEOUT` for
    /// channel space; if the channel is still full (or the writer task has
    /// exited) the record is dropped rather than blocking the request path,
    /// incrementing `signal_hub_ledger_drops_total` when a registry is attached.
    pub async fn record(&self, mut record: UsageRecord) -> anyhow::Result<()> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        match tokio::time::timeout(LEDGER_SEND_TIMEOUT, self.sender.send(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(anyhow::anyhow!("cost ledger writer task is no longer running")),
            Err(_) => {
                if let Some(metrics) = self.metrics.read().as_ref() {
                    metrics.increment("signal_hub_ledger_drops_total", 1);
                }
                Err(anyhow::anyhow!(
                    "cost ledger channel full; record dropped after {LEDGER_SEND_TIMEOUT:?}"
                ))
            }
        }
    }

    /// Most recent records, newest first, optionally restricted to one client.
    pub fn recent(&self, limit: usize, client: Option<&str>) -> Vec<UsageRecord> {
        let guard = self.records.read();
        guard
            .iter()
            .rev()
            .filter(|r| client.map_or(true, |c| r.client_id.as_deref() == Some(c)))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Per-tier cost totals for records timestamped within `[start, end]`.
    pub fn cost_by_tier(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> HashMap<Tier, f64> {
        let guard = self.records.read();
        let mut totals: HashMap<Tier, f64> = HashMap::new();
        for record in guard.iter().filter(|r| r.timestamp >= start && r.timestamp <= end) {
            *totals.entry(record.tier).or_insert(0.0) += record.cost;
        }
        totals
    }

    /// Rolled-up cost/savings breakdown over `period`, or over `[start, end]`
    /// when given explicitly, optionally restricted to one client.
    pub fn summary(
        &self,
        period: CostPeriod,
        tiers: &HashMap<Tier, TierConfig>,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        client: Option<&str>,
    ) -> CostSummary {
        let now = Utc::now();
        let (start_time, end_time) = range.unwrap_or_else(|| (now - period_duration(period), now));

        let guard = self.records.read();
        let in_window: Vec<&UsageRecord> = guard
            .iter()
            .filter(|r| {
                r.timestamp >= start_time
                    && r.timestamp <= end_time
                    && !r.cancelled
                    && client.map_or(true, |c| r.client_id.as_deref() == Some(c))
            })
            .collect();

        let request_count = in_window.len() as u64;
        let total_cost: f64 = in_window.iter().map(|r| r.cost).sum();
        let cache_hits = in_window.iter().filter(|r| r.cache_hit).count() as u64;

        let mut tier_distribution: HashMap<Tier, u64> = HashMap::new();
        for record in &in_window {
            *tier_distribution.entry(record.tier).or_insert(0) += 1;
        }

        let cache_savings: f64 = in_window
            .iter()
            .filter(|r| r.cache_hit)
            .map(|r| {
                tiers
                    .get(&r.tier)
                    .map(|cfg| CostCalculator::calculate(cfg, r.input_tokens, r.output_tokens))
                    .unwrap_or(0.0)
            })
            .sum();

        let routing_savings: f64 = in_window
            .iter()
            .filter(|r| !r.cache_hit && r.tier != BASELINE_TIER)
            .map(|r| {
                let baseline = tiers
                    .get(&BASELINE_TIER)
                    .map(|cfg| CostCalculator::calculate(cfg, r.input_tokens, r.output_tokens))
                    .unwrap_or(r.cost);
                (baseline - r.cost).max(0.0)
            })
            .sum();

        let avg_latency_ms = if in_window.is_empty() {
            0.0
        } else {
            in_window.iter().map(|r| r.latency_ms as f64).sum::<f64>() / in_window.len() as f64
        };

        CostSummary {
            period: Some(period),
            start_time: Some(start_time),
            end_time: Some(end_time),
            total_cost,
            total_saved: cache_savings + routing_savings,
            routing_savings,
            cache_savings,
            request_count,
            cache_hits,
            tier_distribution,
            avg_latency_ms,
        }
    }

    /// One full `CostSummary` rollup per period-sized window, oldest first,
    /// over the last `periods` windows ending now. Walks backward from now
    /// one period at a time and reverses the result so callers see history
    /// left-to-right.
    pub fn trends(
        &self,
        period: CostPeriod,
        periods: u32,
        tiers: &HashMap<Tier, TierConfig>,
    ) -> Vec<CostSummary> {
        let bucket_len = period_duration(period);
        let now = Utc::now();
        let mut windows = Vec::with_capacity(periods as usize);
        for i in 0..periods {
            let end = now - bucket_len * (i as i32);
            let start = end - bucket_len;
            windows.push(self.summary(period, tiers, Some((start, end)), None));
        }
        windows.reverse();
        windows
    }

    pub fn cleanup(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut guard = self.records.write();
        let before = guard.len();
        guard.retain(|r| r.timestamp >= cutoff);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_records
    }
}
