use actix_web::{http::StatusCode, test, web, App};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hub::api::{self, AppState};
use signal_hub::backend::EchoBackend;
use signal_hub::config::{default_routing_config, CacheConfig, RateLimitConfig, ServerConfig, SignalHubConfig};
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

fn test_config() -> SignalHubConfig {
    SignalHubConfig {
        server: ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            workers: 1,
        },
        cache: CacheConfig {
            enabled: true,
            similarity_threshold: 0.85,
            ttl_hours: 24.0,
            max_entries: 1000,
        },
        rate_limit: RateLimitConfig {
            enabled: true,
            window_seconds: 3600,
            default_limit: 2,
            tier_limits: Default::default(),
        },
        routing: default_routing_config(),
        ledger_drain_grace_seconds: 1,
    }
}

fn bootstrap_state() -> web::Data<Arc<AppState>> {
    let cfg = test_config();
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
    let ledger = Arc::new(CostLedger::spawn(1000));
    let metrics = Arc::new(MetricsRegistry::new());
    metrics.register_core_metrics();
    ledger.attach_metrics(metrics.clone());
    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryBackend::new()),
        cfg.rate_limit.window_seconds,
        cfg.rate_limit.default_limit as u32,
    ));

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
    pipeline.push(Arc::new(RateLimitMiddleware::new(rate_limiter, metrics.clone())));
    pipeline.push(Arc::new(CacheMiddleware::new(coordinator.clone(), metrics.clone())));

    web::Data::new(Arc::new(AppState {
        config: shared_config,
        routing,
        ledger,
        metrics,
        cache,
        health,
        pipeline,
        started_at: chrono::Utc::now(),
        shutting_down: AtomicBool::new(false),
    }))
}

fn tool_call_body(id: i64, tool_name: &str, query: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": tool_name, "arguments": { "query": query } }
    })
}

#[actix_web::test]
async fn short_query_routes_small_and_returns_success() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(tool_call_body(1, "search_code", "list functions"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert!(body["result"]["content"][0]["text"].is_string());
}

#[actix_web::test]
async fn complex_query_hits_override_and_still_succeeds() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(tool_call_body(
            2,
            "explain_code",
            "explain the security vulnerability in this auth flow",
        ))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn repeated_query_is_served_from_cache_on_second_call() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req1 = test::TestRequest::post()
        .uri("/rpc")
        .set_json(tool_call_body(3, "explain_code", "how does this retry loop work"))
        .to_request();
    test::call_service(&app, req1).await;

    let req2 = test::TestRequest::post()
        .uri("/rpc")
        .set_json(tool_call_body(4, "explain_code", "how does this retry loop work"))
        .to_request();
    let resp = test::call_service(&app, req2).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn rate_limit_is_enforced_per_client() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let mut body = tool_call_body(5, "search_code", "one");
    body["params"]["arguments"]["client_id"] = json!("same-client");
    let req = test::TestRequest::post().uri("/rpc").set_json(body.clone()).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

    body["id"] = json!(6);
    let req = test::TestRequest::post().uri("/rpc").set_json(body.clone()).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

    body["id"] = json!(7);
    let req = test::TestRequest::post().uri("/rpc").set_json(body).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let rpc_body: Value = test::read_body_json(resp).await;
    assert_eq!(rpc_body["error"]["message"].as_str().unwrap().contains("same-client"), true);
}

#[actix_web::test]
async fn unknown_tool_name_is_tool_not_found() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(tool_call_body(8, "does_not_exist", "irrelevant"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn unknown_method_on_a_request_is_method_not_found() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({ "jsonrpc": "2.0", "id": 9, "method": "totally/unknown" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn unknown_method_on_a_notification_is_silently_dropped() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({ "jsonrpc": "2.0", "method": "totally/unknown" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[actix_web::test]
async fn initialize_returns_server_info_and_capabilities() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({
            "jsonrpc": "2.0", "id": 10, "method": "initialize",
            "params": { "clientInfo": { "name": "test-client", "version": "0.1" } }
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"]["serverInfo"]["name"], "signal-hub");
    assert!(body["result"]["capabilities"].is_object());
}

#[actix_web::test]
async fn tools_list_enumerates_the_full_catalog() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({ "jsonrpc": "2.0", "id": 11, "method": "tools/list" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 8);
    assert!(tools.iter().any(|t| t["name"] == "search_code"));
    assert!(tools.iter().any(|t| t["name"] == "signal_hub_metrics"));
}

#[actix_web::test]
async fn ping_replies_pong_with_timestamp() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({ "jsonrpc": "2.0", "id": 12, "method": "ping" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"]["method"], "pong");
    assert!(body["result"]["timestamp"].is_string());
}

#[actix_web::test]
async fn double_shutdown_is_a_no_op() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let shutdown_body = json!({ "jsonrpc": "2.0", "id": 13, "method": "shutdown" });

    let req = test::TestRequest::post().uri("/rpc").set_json(shutdown_body.clone()).to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"]["status"], "shutting_down");

    let req = test::TestRequest::post().uri("/rpc").set_json(shutdown_body).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"]["status"], "shutting_down");
}

#[actix_web::test]
async fn signal_hub_health_tool_reports_tier_availability() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({
            "jsonrpc": "2.0", "id": 14, "method": "tools/call",
            "params": { "name": "signal_hub_health", "arguments": {} }
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    let payload: Value = serde_json::from_str(body["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["tiers"]["small"], true);
}

#[actix_web::test]
async fn signal_hub_metrics_tool_supports_prometheus_format() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({
            "jsonrpc": "2.0", "id": 15, "method": "tools/call",
            "params": { "name": "signal_hub_metrics", "arguments": { "format": "prometheus" } }
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    let payload: Value = serde_json::from_str(body["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["format"], "prometheus");
    assert!(payload["body"].as_str().unwrap().contains("# HELP"));
}

#[actix_web::test]
async fn unsupported_jsonrpc_version_is_invalid_request() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(json!({ "jsonrpc": "1.0", "id": 18, "method": "ping" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], -32600);
}

#[actix_web::test]
async fn malformed_json_body_yields_parse_error() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not valid json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], -32700);
}

#[actix_web::test]
async fn healthz_reports_ok() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::get().uri("/healthz").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
}

#[actix_web::test]
async fn stats_endpoint_reflects_recorded_usage() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(tool_call_body(16, "search_code", "find the main entry point"))
        .to_request();
    test::call_service(&app, req).await;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let req = test::TestRequest::get().uri("/stats").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["recent"].as_array().unwrap().len() >= 1);
}

#[actix_web::test]
async fn admin_rules_reload_replaces_routing_document() {
    let state = bootstrap_state();
    let app = test::init_service(App::new().app_data(state).configure(api::configure)).await;

    let mut doc = default_routing_config();
    doc.default_tier = signal_hub::types::Tier::Large;
    let payload = json!({
        "tiers": doc.tiers,
        "rules": [],
        "overrides": [],
        "default_tier": "large"
    });

    let req = test::TestRequest::post()
        .uri("/admin/rules/reload")
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::post()
        .uri("/rpc")
        .set_json(tool_call_body(17, "search_code", "anything at all now routes to default"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}
