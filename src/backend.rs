use async_trait::async_trait;
use serde_json::Value;

use crate::types::Tier;

/// Result of invoking a downstream model for a given tier.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub content: Value,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The external collaborator this server routes to. A real implementation
/// talks to whatever LLM provider backs a given tier; it is outside this
/// crate's scope, which only defines the seam.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn call(&self, tier: Tier, method: &str, params: &Value) -> anyhow::Result<BackendResponse>;
}

/// Deterministic stand-in used by integration tests and local exploration:
/// echoes the request back with a token count derived from its size, and
/// never actually reaches a network.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoBackend;

#[async_trait]
impl ModelBackend for EchoBackend {
    async fn call(&self, tier: Tier, method: &str, params: &Value) -> anyhow::Result<BackendResponse> {
        let input_tokens = params.to_string().len().div_ceil(4) as u32;
        Ok(BackendResponse {
            content: serde_json::json!({
                "tier": tier.as_str(),
                "method": method,
                "echo": params,
            }),
            input_tokens,
            output_tokens: input_tokens / 2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_backend_reports_tier_and_method() {
        let backend = EchoBackend;
        let response = backend
            .call(Tier::Small, "search_code", &serde_json::json!({"q": "fn main"}))
            .await
            .unwrap();
        assert_eq!(response.content["tier"], "small");
        assert_eq!(response.content["method"], "search_code");
        assert!(response.input_tokens > 0);
    }
}
