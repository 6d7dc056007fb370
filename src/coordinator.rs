use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use crate::backend::ModelBackend;
use crate::cost::{CostCalculator, CostLedger};
use crate::errors::SignalHubError;
use crate::health::HealthStore;
use crate::routing::RoutingEngine;
use crate::semantic_cache::SemanticCache;
use crate::types::{CacheStatus, Request, UsageRecord};

const RETRY_BACKOFFS_MS: [u64; 2] = [100, 400];

/// Orchestrates a single request end to end: cache lookup, routing decision,
/// a backend call with bounded retry/backoff, a ledger entry, and a cache
/// store on miss. Sits as the terminal handler at the bottom of the
/// middleware chain.
pub struct RequestCoordinator {
    routing: Arc<RoutingEngine>,
    cache: Arc<SemanticCache>,
    backend: Arc<dyn ModelBackend>,
    ledger: Arc<CostLedger>,
    health: HealthStore,
}

pub struct CoordinatorOutput {
    pub response: Value,
    pub cache_status: CacheStatus,
    pub tier: crate::types::Tier,
}

impl RequestCoordinator {
    pub fn new(
        routing: Arc<RoutingEngine>,
        cache: Arc<SemanticCache>,
        backend: Arc<dyn ModelBackend>,
        ledger: Arc<CostLedger>,
        health: HealthStore,
    ) -> Self {
        Self {
            routing,
            cache,
            backend,
            ledger,
            health,
        }
    }

    /// Trailing hit-rate/size snapshot of the semantic cache, for metrics export.
    pub fn cache_stats(&self) -> crate::semantic_cache::CacheStats {
        self.cache.stats()
    }

    /// Probes the semantic cache without running routing or the backend.
    /// Used by the protocol-boundary cache middleware to short-circuit the
    /// chain before routing/dispatch; `handle` below performs the same check
    /// again as the authoritative, ledger-accounted lookup so direct callers
    /// of `handle` (tests, or a coordinator used outside the middleware
    /// chain) see correct behavior without depending on that middleware.
    pub async fn probe_cache(&self, request: &Request) -> Option<CoordinatorOutput> {
        let context = request.params.get("context").cloned();
        try_cache_hit(&self.cache, &self.ledger, request, context.as_ref(), Instant::now()).await
    }

    pub async fn handle(
        &self,
        mut request: Request,
        tier_config: &std::collections::HashMap<crate::types::Tier, crate::types::TierConfig>,
    ) -> Result<CoordinatorOutput, SignalHubError> {
        let started = Instant::now();
        let context = request.params.get("context").cloned();
        let cancel = request.cancel.clone();

        if is_cancelled(&cancel) {
            return Err(self.record_cancelled(&request, started).await);
        }

        if let Some(output) = try_cache_hit(&self.cache, &self.ledger, &request, context.as_ref(), started).await {
            return Ok(output);
        }

        if is_cancelled(&cancel) {
            return Err(self.record_cancelled(&request, started).await);
        }

        let selection = self.routing.route(&mut request);
        let tier = selection.tier;

        let timeout = Duration::from_secs(
            tier_config.get(&tier).map(|cfg| cfg.timeout_secs).unwrap_or(30),
        );

        let mut last_err = None;
        let mut backend_response = None;
        let mut was_cancelled = false;
        for attempt in 0..=RETRY_BACKOFFS_MS.len() {
            let call_started = Instant::now();
            let outcome = match &cancel {
                Some(token) => {
                    tokio::select! {
                        result = tokio::time::timeout(timeout, self.backend.call(tier, &request.method, &request.params)) => result,
                        _ = token.cancelled() => {
                            was_cancelled = true;
                            break;
                        }
                    }
                }
                None => tokio::time::timeout(timeout, self.backend.call(tier, &request.method, &request.params)).await,
            };
            match outcome {
                Ok(Ok(response)) => {
                    self.health.record_call(tier, call_started.elapsed().as_millis() as u64, true);
                    backend_response = Some(response);
                    break;
                }
                Ok(Err(err)) => {
                    self.health.record_call(tier, call_started.elapsed().as_millis() as u64, false);
                    last_err = Some(err);
                    if attempt < RETRY_BACKOFFS_MS.len() {
                        tokio::time::sleep(Duration::from_millis(RETRY_BACKOFFS_MS[attempt])).await;
                    }
                }
                Err(_elapsed) => {
                    // Timeout is a transient failure, same retry treatment as a backend error.
                    self.health.record_call(tier, call_started.elapsed().as_millis() as u64, false);
                    last_err = Some(anyhow::anyhow!("backend call for tier {tier} timed out after {timeout:?}"));
                    if attempt < RETRY_BACKOFFS_MS.len() {
                        tokio::time::sleep(Duration::from_millis(RETRY_BACKOFFS_MS[attempt])).await;
                    }
                }
            }
            if is_cancelled(&cancel) {
                was_cancelled = true;
                break;
            }
        }

        if was_cancelled {
            return Err(self.record_cancelled(&request, started).await);
        }

        let response = match backend_response {
            Some(r) => r,
            None => {
                return Err(SignalHubError::ToolError(
                    last_err.map(|e| e.to_string()).unwrap_or_else(|| "backend call failed".into()),
                ))
            }
        };

        let cost = tier_config
            .get(&tier)
            .map(|cfg| CostCalculator::calculate(cfg, response.input_tokens, response.output_tokens))
            .unwrap_or(0.0);

        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            tier,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            cost,
            routing_reason: selection.decision.reason.clone(),
            cache_hit: false,
            latency_ms: started.elapsed().as_millis() as u64,
            method: Some(request.method.clone()),
            client_id: request.client_id.clone(),
            cancelled: false,
        };
        let _ = self.ledger.record(record).await;

        self.cache
            .store(&request.query_text, response.content.clone(), tier, context.as_ref(), None)
            .await;

        Ok(CoordinatorOutput {
            response: response.content,
            cache_status: CacheStatus::Miss,
            tier,
        })
    }

    /// Records a zero-cost, `cancelled=true` `UsageRecord` and returns the
    /// error to propagate.
    async fn record_cancelled(&self, request: &Request, started: Instant) -> SignalHubError {
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            tier: crate::types::Tier::Small,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            routing_reason: "cancelled".into(),
            cache_hit: false,
            latency_ms: started.elapsed().as_millis() as u64,
            method: Some(request.method.clone()),
            client_id: request.client_id.clone(),
            cancelled: true,
        };
        let _ = self.ledger.record(record).await;
        SignalHubError::Cancelled
    }
}

fn is_cancelled(token: &Option<tokio_util::sync::CancellationToken>) -> bool {
    token.as_ref().is_some_and(|t| t.is_cancelled())
}

/// Looks the request up in the semantic cache; on a hit, records a
/// zero-cost `UsageRecord` (`cache_hit=true`) and returns the cached
/// response. Ledger failures are non-fatal: the hit is still served.
async fn try_cache_hit(
    cache: &SemanticCache,
    ledger: &CostLedger,
    request: &Request,
    context: Option<&Value>,
    started: Instant,
) -> Option<CoordinatorOutput> {
    let (entry, status) = cache.lookup(&request.query_text, context).await.ok().flatten()?;

    let record = UsageRecord {
        id: Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now(),
        tier: entry.tier_used,
        input_tokens: 0,
        output_tokens: 0,
        cost: 0.0,
        routing_reason: "cache_hit".into(),
        cache_hit: true,
        latency_ms: started.elapsed().as_millis() as u64,
        method: Some(request.method.clone()),
        client_id: request.client_id.clone(),
        cancelled: false,
    };
    let _ = ledger.record(record).await;

    Some(CoordinatorOutput {
        response: entry.response,
        cache_status: status,
        tier: entry.tier_used,
    })
}
