use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signal_hub::api::{self, AppState};
use signal_hub::backend::EchoBackend;
use signal_hub::config::SignalHubConfig;
use signal_hub::cost::CostLedger;
use signal_hub::coordinator::RequestCoordinator;
use signal_hub::embedder::HashingEmbedder;
use signal_hub::health::HealthStore;
use signal_hub::metrics::MetricsRegistry;
use signal_hub::middleware::{
    CacheMiddleware, HandlerOutput, LoggingMiddleware, MetricsMiddleware, MiddlewareStack, RateLimitMiddleware,
};
use signal_hub::rate_limit::{MemoryBackend, RateLimiter};
use signal_hub::routing::RoutingEngine;
use signal_hub::semantic_cache::SemanticCache;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_hub=info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = SignalHubConfig::from_env().context("load signal hub config")?;
    let shared_config = Arc::new(cfg.clone());

    let health = HealthStore::new();
    let routing = Arc::new(RoutingEngine::new(cfg.routing.clone(), health.clone()));
    let cache = Arc::new(SemanticCache::new(
        Arc::new(HashingEmbedder),
        cfg.cache.max_entries,
        cfg.cache.similarity_threshold,
        cfg.cache.ttl_hours,
        cfg.cache.enabled,
    ));
    let ledger = Arc::new(CostLedger::spawn(100_000));
    let metrics = Arc::new(MetricsRegistry::new());
    metrics.register_core_metrics();
    ledger.attach_metrics(metrics.clone());
    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryBackend::new()),
        cfg.rate_limit.window_seconds,
        cfg.rate_limit.default_limit as u32,
    ));
    for (tier, limit) in &cfg.rate_limit.tier_limits {
        rate_limiter.set_tier_limit(*tier, *limit as u32);
    }

    let coordinator = Arc::new(RequestCoordinator::new(
        routing.clone(),
        cache.clone(),
        Arc::new(EchoBackend),
        ledger.clone(),
        health.clone(),
    ));

    let terminal_config = shared_config.clone();
    let terminal_coordinator = coordinator.clone();
    let terminal: signal_hub::middleware::Terminal = Arc::new(move |request| {
        let coordinator = terminal_coordinator.clone();
        let config = terminal_config.clone();
        Box::pin(async move {
            let output = coordinator.handle(request, &config.routing.tiers).await?;
            Ok(HandlerOutput {
                response: output.response,
                cache_status: output.cache_status,
                headers: Vec::new(),
            })
        })
    });

    let mut pipeline = MiddlewareStack::new(terminal);
    pipeline.push(Arc::new(LoggingMiddleware));
    pipeline.push(Arc::new(MetricsMiddleware::new(metrics.clone())));
    if cfg.rate_limit.enabled {
        pipeline.push(Arc::new(RateLimitMiddleware::new(rate_limiter, metrics.clone())));
    }
    pipeline.push(Arc::new(CacheMiddleware::new(coordinator.clone(), metrics.clone())));

    let state = Arc::new(AppState {
        config: shared_config,
        routing,
        ledger,
        metrics,
        cache,
        health,
        pipeline,
        started_at: chrono::Utc::now(),
        shutting_down: std::sync::atomic::AtomicBool::new(false),
    });

    let bind_addr: SocketAddr = cfg.server.bind_addr.parse().with_context(|| {
        format!(
            "invalid SIGNAL_HUB_SERVER_BIND '{}': expected host:port",
            cfg.server.bind_addr
        )
    })?;

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![
                actix_web::http::header::CONTENT_TYPE,
                actix_web::http::header::ACCEPT,
                actix_web::http::header::AUTHORIZATION,
            ])
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(api::configure)
    })
    .bind(bind_addr)?
    .workers(cfg.server.workers)
    .run()
    .await?;

    Ok(())
}
