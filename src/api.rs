use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{RoutingConfigDocument, SignalHubConfig};
use crate::cost::CostLedger;
use crate::errors::SignalHubError;
use crate::health::HealthStore;
use crate::metrics::MetricsRegistry;
use crate::middleware::MiddlewareStack;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::routing::RoutingEngine;
use crate::semantic_cache::SemanticCache;
use crate::tools;
use crate::types::{Request, Tier};

const SERVER_NAME: &str = "signal-hub";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a request handler needs, constructed once at startup and
/// shared across workers via `web::Data`.
pub struct AppState {
    pub config: Arc<SignalHubConfig>,
    pub routing: Arc<RoutingEngine>,
    pub ledger: Arc<CostLedger>,
    pub metrics: Arc<MetricsRegistry>,
    pub cache: Arc<SemanticCache>,
    pub health: HealthStore,
    pub pipeline: MiddlewareStack,
    pub started_at: DateTime<Utc>,
    pub shutting_down: AtomicBool,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(post_rpc)
        .service(get_health)
        .service(get_ready)
        .service(get_stats)
        .service(reload_rules);
}

/// Result of dispatching one JSON-RPC method call: the reply body (absent
/// for a notification or a dropped unrecognized notification) plus any
/// response headers contributed by the middleware pipeline along the way.
struct DispatchOutcome {
    value: Option<Value>,
    headers: Vec<(&'static str, String)>,
}

impl DispatchOutcome {
    fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            headers: Vec::new(),
        }
    }

    fn empty() -> Self {
        Self {
            value: None,
            headers: Vec::new(),
        }
    }
}

#[post("/rpc")]
async fn post_rpc(state: web::Data<Arc<AppState>>, payload: web::Bytes) -> HttpResponse {
    let rpc_request: JsonRpcRequest = match serde_json::from_slice(&payload) {
        Ok(req) => req,
        Err(err) => {
            let rpc_err: JsonRpcError = (&SignalHubError::ParseError(err.to_string())).into();
            return HttpResponse::BadRequest().json(JsonRpcResponse::failure(None, rpc_err));
        }
    };

    let id = rpc_request.id.clone();
    let is_notification = rpc_request.is_notification();

    match dispatch(&state, rpc_request).await {
        Ok(outcome) => {
            let reply = if is_notification { None } else { outcome.value };
            let mut builder = match &reply {
                Some(_) => HttpResponse::Ok(),
                None => HttpResponse::NoContent(),
            };
            for (name, value) in &outcome.headers {
                builder.insert_header((*name, value.clone()));
            }
            match reply {
                Some(result) => builder.json(JsonRpcResponse::success(id, result)),
                None => builder.finish(),
            }
        }
        Err(err) => {
            if is_notification {
                // Notifications never receive a response, even on failure;
                // the error is still logged at the call site.
                return HttpResponse::NoContent().finish();
            }
            let rpc_err: JsonRpcError = (&err).into();
            let status = err.status_code();
            HttpResponse::build(status).json(JsonRpcResponse::failure(id, rpc_err))
        }
    }
}

/// Routes a decoded JSON-RPC envelope by `method`. Returns a `DispatchOutcome`
/// whose `value` is `None` for a notification on an unrecognized method
/// (logged and silently dropped), and `Err` for everything that maps onto
/// the closed error-code set.
async fn dispatch(state: &AppState, rpc_request: JsonRpcRequest) -> Result<DispatchOutcome, SignalHubError> {
    if rpc_request.jsonrpc != crate::protocol::JSONRPC_VERSION {
        return Err(SignalHubError::InvalidRequest(format!(
            "unsupported jsonrpc version '{}', expected '{}'",
            rpc_request.jsonrpc,
            crate::protocol::JSONRPC_VERSION
        )));
    }

    match rpc_request.method.as_str() {
        "initialize" => Ok(DispatchOutcome::value(handle_initialize(&rpc_request.params))),
        "tools/list" => Ok(DispatchOutcome::value(json!({ "tools": tools::catalog() }))),
        "tools/call" => {
            let (value, headers) = handle_tools_call(state, rpc_request.params).await?;
            Ok(DispatchOutcome {
                value: Some(value),
                headers,
            })
        }
        "shutdown" => Ok(DispatchOutcome::value(handle_shutdown(state))),
        "ping" => Ok(DispatchOutcome::value(
            json!({ "method": "pong", "timestamp": Utc::now().to_rfc3339() }),
        )),
        other => {
            if rpc_request.is_notification() {
                tracing::warn!(method = %other, "dropping notification for unrecognized method");
                Ok(DispatchOutcome::empty())
            } else {
                Err(SignalHubError::MethodNotFound(other.to_string()))
            }
        }
    }
}

fn handle_initialize(params: &Value) -> Value {
    let client_name = params
        .get("clientInfo")
        .and_then(|c| c.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    tracing::info!(client = %client_name, "client initialized");
    json!({
        "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
        "capabilities": { "tools": { "listChanged": false } },
    })
}

fn handle_shutdown(state: &AppState) -> Value {
    let already_shutting_down = state.shutting_down.swap(true, Ordering::SeqCst);
    if !already_shutting_down {
        tracing::info!("shutdown requested; draining in-flight work");
    }
    json!({ "status": "shutting_down" })
}

async fn handle_tools_call(
    state: &AppState,
    params: Value,
) -> Result<(Value, Vec<(&'static str, String)>), SignalHubError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SignalHubError::InvalidParams("tools/call requires a string 'name'".into()))?
        .to_string();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    if tools::is_routed(&name) {
        let request = build_routed_request(&name, &arguments);
        let output = state.pipeline.run(request).await?;
        return Ok((tools::text_content(&output.response), output.headers));
    }

    if tools::is_local(&name) {
        let payload = handle_local_tool(state, &name, &arguments);
        return Ok((tools::text_content(&payload), Vec::new()));
    }

    Err(SignalHubError::ToolNotFound(name))
}

fn build_routed_request(tool_name: &str, arguments: &Value) -> Request {
    let mut request = Request {
        id: uuid::Uuid::new_v4().to_string(),
        method: tool_name.to_string(),
        params: arguments.clone(),
        timestamp: Utc::now(),
        ..Default::default()
    };
    request.query_text = arguments
        .get("query")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default();
    request.client_id = arguments.get("client_id").and_then(Value::as_str).map(str::to_string);
    request.session_id = arguments.get("session_id").and_then(Value::as_str).map(str::to_string);
    request.preferred_tier = arguments
        .get("preferred_tier")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok());
    request.retrieved_context_tokens = arguments
        .get("retrieved_context_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    request
}

fn handle_local_tool(state: &AppState, name: &str, arguments: &Value) -> Value {
    match name {
        "get_server_info" => json!({
            "name": SERVER_NAME,
            "version": SERVER_VERSION,
            "tools": tools::ROUTED_TOOLS.iter().chain(tools::LOCAL_TOOLS.iter()).collect::<Vec<_>>(),
        }),
        "signal_hub_health" => signal_hub_health(state),
        "signal_hub_metrics" => {
            let format = arguments.get("format").and_then(Value::as_str).unwrap_or("json");
            if format == "prometheus" {
                json!({ "format": "prometheus", "body": state.metrics.export_prometheus() })
            } else {
                json!({ "format": "json", "body": state.metrics.export_json() })
            }
        }
        "signal_hub_system_info" => signal_hub_system_info(state),
        other => json!({ "error": format!("unhandled local tool {other}") }),
    }
}

fn signal_hub_health(state: &AppState) -> Value {
    let tiers: serde_json::Map<String, Value> = Tier::all()
        .into_iter()
        .map(|tier| (tier.as_str().to_string(), json!(state.health.is_available(tier))))
        .collect();
    json!({
        "status": "ok",
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds().max(0),
        "timestamp": Utc::now().to_rfc3339(),
        "version": SERVER_VERSION,
        "ready": !state.shutting_down.load(Ordering::SeqCst),
        "checks": {
            "embedder": true,
            "vector_index": true,
            "cache": true,
            "ledger": true,
        },
        "tiers": tiers,
    })
}

fn signal_hub_system_info(state: &AppState) -> Value {
    let stats = state.cache.stats();
    json!({
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds().max(0),
        "workers": state.config.server.workers,
        "cache": {
            "size": stats.size,
            "hit_rate": stats.hit_rate,
            "hits": stats.hits,
            "misses": stats.misses,
        },
        "ledger": {
            "recent_count": state.ledger.len(),
            "capacity": state.ledger.capacity(),
        },
        "tiers_configured": state.config.routing.tiers.keys().map(Tier::as_str).collect::<Vec<_>>(),
    })
}

#[get("/healthz")]
async fn get_health(state: web::Data<Arc<AppState>>) -> impl Responder {
    #[derive(Serialize)]
    struct HealthResponse {
        status: &'static str,
        uptime_seconds: i64,
        timestamp: String,
        version: &'static str,
    }
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0),
        timestamp: Utc::now().to_rfc3339(),
        version: SERVER_VERSION,
    })
}

#[get("/readyz")]
async fn get_ready(state: web::Data<Arc<AppState>>) -> impl Responder {
    #[derive(Serialize)]
    struct ReadyResponse {
        ready: bool,
        checks: Value,
    }
    HttpResponse::Ok().json(ReadyResponse {
        ready: !state.shutting_down.load(Ordering::SeqCst),
        checks: json!({ "embedder": true, "vector_index": true, "cache": true, "ledger": true }),
    })
}

#[get("/stats")]
async fn get_stats(state: web::Data<Arc<AppState>>) -> impl Responder {
    #[derive(Serialize)]
    struct StatsResponse {
        metrics: Value,
        cost_by_tier: std::collections::HashMap<crate::types::Tier, f64>,
        recent: Vec<crate::types::UsageRecord>,
        trends: Vec<crate::types::CostSummary>,
    }
    let now = Utc::now();
    HttpResponse::Ok().json(StatsResponse {
        metrics: state.metrics.export_json(),
        cost_by_tier: state.ledger.cost_by_tier(now - chrono::Duration::days(30), now),
        recent: state.ledger.recent(20, None),
        trends: state
            .ledger
            .trends(crate::types::CostPeriod::Daily, 7, &state.config.routing.tiers),
    })
}

#[post("/admin/rules/reload")]
async fn reload_rules(
    state: web::Data<Arc<AppState>>,
    payload: web::Json<RoutingDocumentPayload>,
) -> Result<impl Responder, SignalHubError> {
    let document: RoutingConfigDocument = payload.into_inner().into();
    state.routing.reload(document);
    Ok(HttpResponse::NoContent())
}

/// Wire shape for a routing document reload; mirrors `RoutingConfigDocument`
/// with serde derives since the runtime struct intentionally doesn't carry
/// them all (kept lean for the hot ArcSwap path).
#[derive(serde::Deserialize)]
pub struct RoutingDocumentPayload {
    tiers: std::collections::HashMap<crate::types::Tier, crate::types::TierConfig>,
    rules: Vec<crate::types::Rule>,
    #[serde(default)]
    overrides: Vec<crate::types::Override>,
    default_tier: crate::types::Tier,
}

impl From<RoutingDocumentPayload> for RoutingConfigDocument {
    fn from(payload: RoutingDocumentPayload) -> Self {
        RoutingConfigDocument {
            tiers: payload.tiers,
            rules: payload.rules,
            overrides: payload.overrides,
            default_tier: payload.default_tier,
        }
    }
}
