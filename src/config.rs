use anyhow::{Context, Result};
use std::{collections::HashMap, env, path::PathBuf};

use crate::types::{ComplexityIndicators, Rule, RuleKind, RuleThresholds, Tier, TierConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub similarity_threshold: f32,
    pub ttl_hours: f64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.85,
            ttl_hours: 24.0,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_seconds: u64,
    pub default_limit: u64,
    pub tier_limits: HashMap<Tier, u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: 3600,
            default_limit: 1000,
            tier_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingConfigDocument {
    pub tiers: HashMap<Tier, TierConfig>,
    pub rules: Vec<Rule>,
    pub overrides: Vec<crate::types::Override>,
    pub default_tier: Tier,
}

impl Default for RoutingConfigDocument {
    fn default() -> Self {
        default_routing_config()
    }
}

#[derive(Debug, Clone)]
pub struct SignalHubConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub routing: RoutingConfigDocument,
    pub ledger_drain_grace_seconds: u64,
}

impl SignalHubConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr =
            env::var("SIGNAL_HUB_SERVER_BIND").unwrap_or_else(|_| "0.0.0.0:8099".to_string());
        let workers = env::var("SIGNAL_HUB_SERVER_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(num_cpus::get_physical);

        let cache = CacheConfig {
            enabled: env_bool("SIGNAL_HUB_CACHE_ENABLED", true),
            similarity_threshold: env_parse("SIGNAL_HUB_CACHE_SIMILARITY_THRESHOLD", 0.85),
            ttl_hours: env_parse("SIGNAL_HUB_CACHE_TTL_HOURS", 24.0),
            max_entries: env_parse("SIGNAL_HUB_CACHE_MAX_ENTRIES", 10_000),
        };

        let mut tier_limits = HashMap::new();
        for tier in Tier::all() {
            let env_key = format!("SIGNAL_HUB_RATE_LIMIT_TIER_LIMITS_{}", tier.as_str().to_uppercase());
            if let Ok(value) = env::var(&env_key) {
                if let Ok(limit) = value.parse::<u64>() {
                    tier_limits.insert(tier, limit);
                }
            }
        }

        let rate_limit = RateLimitConfig {
            enabled: env_bool("SIGNAL_HUB_RATE_LIMIT_ENABLED", true),
            window_seconds: env_parse("SIGNAL_HUB_RATE_LIMIT_WINDOW_SECONDS", 3600),
            default_limit: env_parse("SIGNAL_HUB_RATE_LIMIT_DEFAULT_LIMIT", 1000),
            tier_limits,
        };

        let routing = match env::var("SIGNAL_HUB_ROUTING_CONFIG_PATH") {
            Ok(path) => load_routing_document(&PathBuf::from(path))
                .context("load routing configuration document")?,
            Err(_) => default_routing_config(),
        };

        let ledger_drain_grace_seconds = env_parse("SIGNAL_HUB_SHUTDOWN_GRACE_SECONDS", 10);

        Ok(Self {
            server: ServerConfig { bind_addr, workers },
            cache,
            rate_limit,
            routing,
            ledger_drain_grace_seconds,
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn load_routing_document(path: &PathBuf) -> Result<RoutingConfigDocument> {
    // The routing document uses the same serde types the engine operates on
    // at runtime, so the on-disk format is exactly the in-memory shape.
    #[derive(serde::Deserialize)]
    struct Document {
        tiers: HashMap<Tier, TierConfig>,
        rules: Vec<Rule>,
        #[serde(default)]
        overrides: Vec<crate::types::Override>,
        default_tier: Tier,
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read routing config at {path:?}"))?;
    let doc: Document = serde_json::from_str(&raw)
        .or_else(|_| serde_yaml::from_str(&raw))
        .with_context(|| "parse routing config document")?;

    Ok(RoutingConfigDocument {
        tiers: doc.tiers,
        rules: doc.rules,
        overrides: doc.overrides,
        default_tier: doc.default_tier,
    })
}

/// Seed rule set and tier prices, grounded in the original system's default
/// keyword lists and thresholds.
pub fn default_routing_config() -> RoutingConfigDocument {
    let mut tiers = HashMap::new();
    tiers.insert(
        Tier::Small,
        TierConfig {
            max_tokens: Some(1000),
            max_complexity: crate::types::ComplexityLevel::Simple,
            preferred_tasks: vec!["search_code".into(), "find_similar".into()],
            price_per_1k_in: 0.00025,
            price_per_1k_out: 0.00125,
            timeout_secs: 30,
        },
    );
    tiers.insert(
        Tier::Medium,
        TierConfig {
            max_tokens: Some(4000),
            max_complexity: crate::types::ComplexityLevel::Moderate,
            preferred_tasks: vec!["explain_code".into(), "get_context".into()],
            price_per_1k_in: 0.003,
            price_per_1k_out: 0.015,
            timeout_secs: 30,
        },
    );
    tiers.insert(
        Tier::Large,
        TierConfig {
            max_tokens: None,
            max_complexity: crate::types::ComplexityLevel::Complex,
            preferred_tasks: vec!["analyze_architecture".into()],
            price_per_1k_in: 0.015,
            price_per_1k_out: 0.075,
            timeout_secs: 30,
        },
    );

    let rules = vec![
        Rule {
            name: "length_based".into(),
            enabled: true,
            priority: 1,
            kind: RuleKind::LengthThreshold {
                thresholds: RuleThresholds {
                    small_max: 500,
                    medium_max: 2000,
                },
            },
        },
        Rule {
            name: "complexity_based".into(),
            enabled: true,
            priority: 2,
            kind: RuleKind::ComplexityKeyword {
                indicators: ComplexityIndicators {
                    simple: split_words(
                        "what when where who which list show find get count is are does check verify",
                    ),
                    moderate: split_words(
                        "how why explain describe summarize compare difference similar relate understand clarify elaborate",
                    ),
                    complex: split_words(
                        "analyze design architect optimize refactor implement solve debug performance scale distribute secure",
                    ),
                },
            },
        },
        Rule {
            name: "task_type".into(),
            enabled: true,
            priority: 3,
            kind: RuleKind::TaskType {
                mappings: crate::types::TaskMappings {
                    mappings: HashMap::from([
                        ("search_code".to_string(), Tier::Small),
                        ("find_similar".to_string(), Tier::Small),
                        ("explain_code".to_string(), Tier::Medium),
                        ("get_context".to_string(), Tier::Medium),
                        ("analyze_architecture".to_string(), Tier::Large),
                    ]),
                },
            },
        },
    ];

    let overrides = vec![
        crate::types::Override {
            pattern: r"(?i)(security|vulnerability|exploit|injection|auth|cve)".into(),
            tier: Tier::Large,
            reason: "Security analysis requires maximum care and capability".into(),
        },
        crate::types::Override {
            pattern: r"(?i)(performance|optimize|bottleneck|profil|benchmark)".into(),
            tier: Tier::Large,
            reason: "Performance optimization needs deep technical analysis".into(),
        },
        crate::types::Override {
            pattern: r"(?i)(architect|design\s+pattern|scalab|distribut)".into(),
            tier: Tier::Large,
            reason: "System design requires comprehensive understanding".into(),
        },
        crate::types::Override {
            pattern: r"(?i)(debug|troubleshoot|root\s+cause|critical\s+bug)".into(),
            tier: Tier::Large,
            reason: "Complex debugging needs advanced reasoning".into(),
        },
    ];

    RoutingConfigDocument {
        tiers,
        rules,
        overrides,
        default_tier: Tier::Small,
    }
}

fn split_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}
