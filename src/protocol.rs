use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent for notifications, which never receive a response.
    #[serde(default)]
    pub id: Option<Value>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC 2.0 error codes, plus the application-specific range
/// (-32000..-32099) this server uses for its own closed error set.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const TOOL_NOT_FOUND: i32 = -32000;
    pub const TOOL_ERROR: i32 = -32001;
    pub const RATE_LIMIT_EXCEEDED: i32 = -32002;
}

impl From<&crate::errors::SignalHubError> for JsonRpcError {
    fn from(err: &crate::errors::SignalHubError) -> Self {
        use crate::errors::SignalHubError as E;
        let code = match err {
            E::ParseError(_) => error_codes::PARSE_ERROR,
            E::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            E::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            E::InvalidParams(_) => error_codes::INVALID_PARAMS,
            E::ToolNotFound(_) => error_codes::TOOL_NOT_FOUND,
            E::ToolError(_) => error_codes::TOOL_ERROR,
            E::RateLimitExceeded { .. } => error_codes::RATE_LIMIT_EXCEEDED,
            // Not part of the closed wire set; cancellation is a concurrency
            // concern, surfaced on the wire as an internal error but tagged
            // distinctly in logs/metrics via `SignalHubError::code()`.
            E::Cancelled | E::InternalError(_) | E::Io(_) | E::Any(_) => error_codes::INTERNAL_ERROR,
        };
        let data = match err {
            E::RateLimitExceeded { retry_after_secs, .. } => {
                Some(serde_json::json!({ "retry_after_secs": retry_after_secs }))
            }
            _ => None,
        };
        JsonRpcError {
            code,
            message: err.to_string(),
            data,
        }
    }
}
