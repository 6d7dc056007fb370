use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Stable error codes from the closed set the transport contract exposes
/// (see `protocol.rs`'s `error_codes` module for the matching wire codes).
#[derive(Debug, Error)]
pub enum SignalHubError {
    #[error("failed to parse request: {0}")]
    ParseError(String),
    #[error("invalid JSON-RPC request: {0}")]
    InvalidRequest(String),
    #[error("unknown method: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unknown tool: {0}")]
    ToolNotFound(String),
    #[error("tool call failed: {0}")]
    ToolError(String),
    #[error("rate limit exceeded for {key}: {current}/{limit}")]
    RateLimitExceeded {
        key: String,
        limit: u64,
        current: u64,
        retry_after_secs: u64,
    },
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl ResponseError for SignalHubError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            retry_after_secs: match self {
                SignalHubError::RateLimitExceeded {
                    retry_after_secs, ..
                } => Some(*retry_after_secs),
                _ => None,
            },
        };
        let mut response = HttpResponse::build(status);
        if let SignalHubError::RateLimitExceeded {
            limit,
            retry_after_secs,
            ..
        } = self
        {
            response.insert_header(("Retry-After", retry_after_secs.to_string()));
            response.insert_header(("X-RateLimit-Limit", limit.to_string()));
            response.insert_header(("X-RateLimit-Remaining", "0"));
            response.insert_header(("X-RateLimit-Reset", retry_after_secs.to_string()));
        }
        response.json(body)
    }
}

impl SignalHubError {
    pub fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            SignalHubError::ParseError(_) => actix_web::http::StatusCode::BAD_REQUEST,
            SignalHubError::InvalidRequest(_) | SignalHubError::InvalidParams(_) => {
                actix_web::http::StatusCode::BAD_REQUEST
            }
            SignalHubError::MethodNotFound(_) | SignalHubError::ToolNotFound(_) => {
                actix_web::http::StatusCode::NOT_FOUND
            }
            SignalHubError::RateLimitExceeded { .. } => {
                actix_web::http::StatusCode::TOO_MANY_REQUESTS
            }
            SignalHubError::ToolError(_) => actix_web::http::StatusCode::BAD_GATEWAY,
            // 499, nginx's "Client Closed Request" convention; there is no
            // standard HTTP status for a cooperative cancellation.
            SignalHubError::Cancelled => actix_web::http::StatusCode::from_u16(499)
                .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR),
            SignalHubError::InternalError(_) | SignalHubError::Io(_) | SignalHubError::Any(_) => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The stable wire code, matching the closed set in the transport contract.
    /// `Cancelled` is not part of that closed set (see `protocol.rs`, which
    /// maps it to `InternalError` on the wire) but is kept distinct here so
    /// logs and metrics can tag it `status=cancelled` rather than as a
    /// generic internal failure.
    pub fn code(&self) -> &str {
        match self {
            SignalHubError::ParseError(_) => "ParseError",
            SignalHubError::InvalidRequest(_) => "InvalidRequest",
            SignalHubError::MethodNotFound(_) => "MethodNotFound",
            SignalHubError::InvalidParams(_) => "InvalidParams",
            SignalHubError::ToolNotFound(_) => "ToolNotFound",
            SignalHubError::ToolError(_) => "ToolError",
            SignalHubError::RateLimitExceeded { .. } => "RateLimitExceeded",
            SignalHubError::Cancelled => "Cancelled",
            SignalHubError::InternalError(_) => "InternalError",
            SignalHubError::Io(_) => "InternalError",
            SignalHubError::Any(_) => "InternalError",
        }
    }
}
