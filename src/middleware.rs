use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use crate::coordinator::RequestCoordinator;
use crate::errors::SignalHubError;
use crate::metrics::MetricsRegistry;
use crate::rate_limit::RateLimiter;
use crate::types::Request;

/// Outcome of dispatching a request through the terminal handler, passed
/// back up through the middleware chain. `headers` accumulates response
/// headers contributed by middleware along the way (e.g. rate-limit
/// headers), surfaced on the HTTP response regardless of cache status.
pub struct HandlerOutput {
    pub response: Value,
    pub cache_status: crate::types::CacheStatus,
    pub headers: Vec<(&'static str, String)>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Terminal = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<HandlerOutput, SignalHubError>> + Send + Sync>;

/// One link in the request pipeline. Each middleware decides whether to
/// call `next` at all, and may inspect/modify the outcome on the way back.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<HandlerOutput, SignalHubError>;
}

/// The remaining chain, callable at most once. Mirrors the "wrap the
/// handler in reverse order" composition of a LIFO middleware stack: the
/// first-registered middleware runs first and is outermost, the
/// last-registered runs last and sits closest to the terminal handler.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    pub fn run(self, request: Request) -> BoxFuture<'a, Result<HandlerOutput, SignalHubError>> {
        Box::pin(async move {
            match self.remaining.split_first() {
                Some((mw, rest)) => {
                    mw.handle(
                        request,
                        Next {
                            remaining: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
                }
                None => (self.terminal)(request).await,
            }
        })
    }
}

/// Ordered chain of middleware wrapping a terminal handler. `run` enters at
/// the first-registered middleware, so registration order reads as
/// outermost-first.
pub struct MiddlewareStack {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Terminal,
}

impl MiddlewareStack {
    pub fn new(terminal: Terminal) -> Self {
        Self {
            middlewares: Vec::new(),
            terminal,
        }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub async fn run(&self, request: Request) -> Result<HandlerOutput, SignalHubError> {
        Next {
            remaining: &self.middlewares,
            terminal: &self.terminal,
        }
        .run(request)
        .await
    }
}

/// Logs method, tier decision (once downstream middleware has set it), and
/// latency at request completion.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<HandlerOutput, SignalHubError> {
        let method = request.method.clone();
        let started = Instant::now();
        let result = next.run(request).await;
        let elapsed_ms = started.elapsed().as_millis();
        match &result {
            Ok(_) => tracing::info!(method = %method, elapsed_ms, "request completed"),
            Err(err) => tracing::warn!(method = %method, elapsed_ms, error = %err, "request failed"),
        }
        result
    }
}

/// Records request counts and latency into the shared metrics registry.
pub struct MetricsMiddleware {
    registry: Arc<MetricsRegistry>,
}

impl MetricsMiddleware {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<HandlerOutput, SignalHubError> {
        let started = Instant::now();
        self.registry.increment("signal_hub_requests_total", 1);
        let result = next.run(request).await;
        self.registry
            .observe("signal_hub_request_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Ok(output) = &result {
            match output.cache_status {
                crate::types::CacheStatus::Hit => {
                    self.registry.increment_labeled("signal_hub_cache_hits_total", &["semantic"], 1)
                }
                crate::types::CacheStatus::Miss => {
                    self.registry.increment_labeled("signal_hub_cache_misses_total", &["semantic"], 1)
                }
            }
        }
        result
    }
}

/// Enforces a per-client sliding-window limit before the request reaches
/// routing or the cache.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    registry: Arc<MetricsRegistry>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, registry: Arc<MetricsRegistry>) -> Self {
        Self { limiter, registry }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<HandlerOutput, SignalHubError> {
        let key = request.client_id.clone().unwrap_or_else(|| "anonymous".to_string());
        let decision = self.limiter.check_with_tier(&key, request.preferred_tier).await;
        if !decision.allowed {
            self.registry.increment("signal_hub_rate_limited_total", 1);
            return Err(SignalHubError::RateLimitExceeded {
                key,
                limit: decision.limit as u64,
                current: decision.current as u64,
                retry_after_secs: decision.retry_after_secs,
            });
        }
        let mut output = next.run(request).await?;
        output.headers.extend(RateLimiter::headers(&decision));
        Ok(output)
    }
}

/// Thin wrapper over the semantic cache at the protocol boundary: a hit here
/// short-circuits the chain before routing/dispatch ever runs. Distinct from
/// (but layered on top of) the coordinator's own cache lookup, which remains
/// the authoritative, ledger-accounted check for callers that invoke the
/// coordinator directly.
pub struct CacheMiddleware {
    coordinator: Arc<RequestCoordinator>,
    registry: Arc<MetricsRegistry>,
}

impl CacheMiddleware {
    pub fn new(coordinator: Arc<RequestCoordinator>, registry: Arc<MetricsRegistry>) -> Self {
        Self { coordinator, registry }
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<HandlerOutput, SignalHubError> {
        let outcome = if let Some(output) = self.coordinator.probe_cache(&request).await {
            Ok(HandlerOutput {
                response: output.response,
                cache_status: output.cache_status,
                headers: Vec::new(),
            })
        } else {
            next.run(request).await
        };

        let stats = self.coordinator.cache_stats();
        self.registry
            .set_gauge_labeled("signal_hub_cache_hit_rate", &["semantic"], stats.hit_rate as f64);
        self.registry.set_gauge("signal_hub_cache_size", stats.size as f64);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::MemoryBackend;
    use serde_json::json;

    fn echo_terminal() -> Terminal {
        Arc::new(|_req: Request| {
            Box::pin(async move {
                Ok(HandlerOutput {
                    response: json!({"ok": true}),
                    cache_status: crate::types::CacheStatus::Miss,
                    headers: Vec::new(),
                })
            })
        })
    }

    #[tokio::test]
    async fn logging_middleware_passes_through_success() {
        let mut stack = MiddlewareStack::new(echo_terminal());
        stack.push(Arc::new(LoggingMiddleware));
        let result = stack.run(Request::default()).await.unwrap();
        assert_eq!(result.response, json!({"ok": true}));
    }

    #[tokio::test]
    async fn metrics_middleware_records_a_request() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.register_core_metrics();
        let mut stack = MiddlewareStack::new(echo_terminal());
        stack.push(Arc::new(MetricsMiddleware::new(registry.clone())));
        stack.run(Request::default()).await.unwrap();
        assert_eq!(registry.export_json()["signal_hub_requests_total"], 1);
    }

    #[tokio::test]
    async fn rate_limit_middleware_blocks_after_budget_exhausted() {
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryBackend::new()), 3600, 1));
        let registry = Arc::new(MetricsRegistry::new());
        registry.register_core_metrics();
        let mut stack = MiddlewareStack::new(echo_terminal());
        stack.push(Arc::new(RateLimitMiddleware::new(limiter, registry)));

        let mut req = Request::default();
        req.client_id = Some("client-a".into());
        assert!(stack.run(req.clone()).await.is_ok());
        assert!(stack.run(req).await.is_err());
    }

    #[tokio::test]
    async fn rate_limit_headers_are_attached_on_an_allowed_response() {
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryBackend::new()), 3600, 5));
        let registry = Arc::new(MetricsRegistry::new());
        registry.register_core_metrics();
        let mut stack = MiddlewareStack::new(echo_terminal());
        stack.push(Arc::new(RateLimitMiddleware::new(limiter, registry)));

        let mut req = Request::default();
        req.client_id = Some("client-a".into());
        let output = stack.run(req).await.unwrap();
        assert!(output.headers.iter().any(|(k, _)| *k == "X-RateLimit-Limit"));
        assert!(output.headers.iter().any(|(k, _)| *k == "X-RateLimit-Remaining"));
        assert!(output.headers.iter().any(|(k, _)| *k == "X-RateLimit-Reset"));
    }

    #[tokio::test]
    async fn cache_middleware_short_circuits_before_terminal_on_hit() {
        use crate::backend::EchoBackend;
        use crate::config::default_routing_config;
        use crate::cost::CostLedger;
        use crate::embedder::HashingEmbedder;
        use crate::health::HealthStore;
        use crate::routing::RoutingEngine;
        use crate::semantic_cache::SemanticCache;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let health = HealthStore::new();
        let routing = Arc::new(RoutingEngine::new(default_routing_config(), health.clone()));
        let cache = Arc::new(SemanticCache::new(Arc::new(HashingEmbedder), 100, 0.85, 24.0, true));
        let ledger = Arc::new(CostLedger::spawn(100));
        cache
            .store("how do I open a file", json!({"text": "use open()"}), crate::types::Tier::Small, None, None)
            .await;
        let coordinator = Arc::new(RequestCoordinator::new(
            routing,
            cache,
            Arc::new(EchoBackend),
            ledger,
            health,
        ));

        let terminal_calls = Arc::new(AtomicUsize::new(0));
        let counter = terminal_calls.clone();
        let terminal: Terminal = Arc::new(move |_req: Request| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutput {
                    response: json!({"ok": true}),
                    cache_status: crate::types::CacheStatus::Miss,
                    headers: Vec::new(),
                })
            })
        });

        let registry = Arc::new(MetricsRegistry::new());
        registry.register_core_metrics();
        let mut stack = MiddlewareStack::new(terminal);
        stack.push(Arc::new(CacheMiddleware::new(coordinator, registry)));

        let mut request = Request::default();
        request.query_text = "how do I open a file".into();
        let output = stack.run(request).await.unwrap();
        assert_eq!(output.cache_status, crate::types::CacheStatus::Hit);
        assert_eq!(terminal_calls.load(Ordering::SeqCst), 0);
    }
}
