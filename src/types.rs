use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }

    pub fn all() -> [Tier; 3] {
        [Tier::Small, Tier::Medium, Tier::Large]
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Tier::Small),
            "medium" => Ok(Tier::Medium),
            "large" => Ok(Tier::Large),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub max_tokens: Option<u32>,
    pub max_complexity: ComplexityLevel,
    #[serde(default)]
    pub preferred_tasks: Vec<String>,
    pub price_per_1k_in: f64,
    pub price_per_1k_out: f64,
    /// Per-tier backend call timeout; exceeding it is a transient failure.
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleThresholds {
    pub small_max: u32,
    pub medium_max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComplexityIndicators {
    #[serde(default)]
    pub simple: Vec<String>,
    #[serde(default)]
    pub moderate: Vec<String>,
    #[serde(default)]
    pub complex: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskMappings {
    #[serde(default)]
    pub mappings: HashMap<String, Tier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    LengthThreshold { thresholds: RuleThresholds },
    ComplexityKeyword { indicators: ComplexityIndicators },
    TaskType { mappings: TaskMappings },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub priority: u8,
    #[serde(flatten)]
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub pattern: String,
    pub tier: Tier,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub tier: Tier,
    pub confidence: f32,
    pub reason: String,
    #[serde(default)]
    pub rules_applied: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSelection {
    pub tier: Tier,
    pub decision: RoutingDecision,
    pub overridden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub preferred_tier: Option<Tier>,
    /// Query text extracted from params for routing/caching purposes; not part
    /// of the wire envelope, populated by the coordinator before dispatch.
    #[serde(skip)]
    pub query_text: String,
    #[serde(default)]
    pub retrieved_context_tokens: u32,
    /// Cooperative cancellation signal checked at each suspension point in
    /// the coordinator. `None` for transports (the HTTP API) that don't yet
    /// surface client disconnection; callers driving the coordinator
    /// directly can supply one to abort pending retries.
    #[serde(skip)]
    pub cancel: Option<tokio_util::sync::CancellationToken>,
}

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub vector: Vec<f32>,
    pub context_key: Option<String>,
}

impl Fingerprint {
    pub fn cosine_similarity(&self, other: &[f32]) -> f32 {
        self.vector.iter().zip(other).map(|(a, b)| a * b).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub query_text: String,
    #[serde(skip)]
    pub fingerprint: Vec<f32>,
    pub context_key: Option<String>,
    pub response: Value,
    pub tier_used: Tier,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub tier: Tier,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub routing_reason: String,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub method: Option<String>,
    pub client_id: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub override_tier: Option<Tier>,
    pub override_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CostPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CostSummary {
    pub period: Option<CostPeriod>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub total_saved: f64,
    pub routing_savings: f64,
    pub cache_savings: f64,
    pub request_count: u64,
    pub cache_hits: u64,
    pub tier_distribution: HashMap<Tier, u64>,
    pub avg_latency_ms: f64,
}

/// Result codes for an MCP/JSON-RPC-shaped reply, see `protocol.rs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
}
