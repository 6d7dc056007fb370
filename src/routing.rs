use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RoutingConfigDocument;
use crate::escalation::EscalationResolver;
use crate::health::HealthStore;
use crate::rules;
use crate::types::{ModelSelection, Request, RoutingDecision, Tier};

const SHORT_CIRCUIT_CONFIDENCE: f32 = 0.95;
const DEFAULT_TIER_CONFIDENCE: f32 = 0.5;
const FALLBACK_CONFIDENCE_PENALTY: f32 = 0.8;

#[derive(Default)]
struct RoutingMetrics {
    rule_hits: DashMap<String, u64>,
    tier_decisions: DashMap<Tier, u64>,
    override_count: DashMap<&'static str, u64>,
}

/// Composes the escalation resolver (B) and rule evaluator (A), records
/// per-rule/tier/override metrics, and falls back away from an unavailable
/// tier without ever upgrading.
pub struct RoutingEngine {
    config: ArcSwap<RoutingConfigDocument>,
    escalation: EscalationResolver,
    health: HealthStore,
    metrics: RoutingMetrics,
}

impl RoutingEngine {
    pub fn new(config: RoutingConfigDocument, health: HealthStore) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            escalation: EscalationResolver::new(),
            health,
            metrics: RoutingMetrics::default(),
        }
    }

    pub fn escalation(&self) -> &EscalationResolver {
        &self.escalation
    }

    /// Hot-reloads the rule set, tier config, and overrides atomically.
    /// Readers never lock; in-flight requests finish against the config they
    /// already acquired, new requests see the swapped value immediately.
    pub fn reload(&self, config: RoutingConfigDocument) {
        self.config.store(Arc::new(config));
    }

    pub fn route(&self, request: &mut Request) -> ModelSelection {
        let started = Instant::now();
        let config = self.config.load();

        if let Some(over) = self.escalation.resolve(request) {
            self.metrics
                .override_count
                .entry("escalation")
                .and_modify(|c| *c += 1)
                .or_insert(1);
            let selection = ModelSelection {
                tier: over.tier,
                decision: RoutingDecision {
                    tier: over.tier,
                    confidence: 1.0,
                    reason: over.reason,
                    rules_applied: Vec::new(),
                },
                overridden: true,
            };
            self.record(&selection);
            tracing::debug!(elapsed_us = started.elapsed().as_micros(), "routed via escalation");
            return selection;
        }

        if let Some(over) = match_override(&config, &request.query_text) {
            self.metrics
                .override_count
                .entry("pattern")
                .and_modify(|c| *c += 1)
                .or_insert(1);
            let selection = ModelSelection {
                tier: over.tier,
                decision: RoutingDecision {
                    tier: over.tier,
                    confidence: 1.0,
                    reason: over.reason.clone(),
                    rules_applied: Vec::new(),
                },
                overridden: true,
            };
            self.record(&selection);
            return selection;
        }

        let mut enabled: Vec<_> = config.rules.iter().filter(|r| r.enabled).collect();
        enabled.sort_by_key(|r| r.priority);

        let mut best: Option<RoutingDecision> = None;
        for rule in enabled {
            if let Some(decision) = rules::evaluate(rule, request) {
                self.metrics
                    .rule_hits
                    .entry(rule.name.clone())
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                let short_circuit = decision.confidence >= SHORT_CIRCUIT_CONFIDENCE;
                let replace = best
                    .as_ref()
                    .map(|b| decision.confidence > b.confidence)
                    .unwrap_or(true);
                if replace {
                    best = Some(decision);
                }
                if short_circuit {
                    break;
                }
            }
        }

        let decision = best.unwrap_or_else(|| RoutingDecision {
            tier: config.default_tier,
            confidence: DEFAULT_TIER_CONFIDENCE,
            reason: "no rule matched; using configured default tier".into(),
            rules_applied: Vec::new(),
        });

        let (final_tier, final_decision) = if self.health.is_available(decision.tier) {
            (decision.tier, decision)
        } else {
            let downgraded = RoutingDecision {
                tier: config.default_tier,
                confidence: decision.confidence * FALLBACK_CONFIDENCE_PENALTY,
                reason: format!(
                    "{} (downgraded: {} unavailable)",
                    decision.reason, decision.tier
                ),
                rules_applied: decision.rules_applied.clone(),
            };
            (config.default_tier, downgraded)
        };

        let selection = ModelSelection {
            tier: final_tier,
            decision: final_decision,
            overridden: false,
        };
        self.record(&selection);
        selection
    }

    fn record(&self, selection: &ModelSelection) {
        self.metrics
            .tier_decisions
            .entry(selection.tier)
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    pub fn tier_decision_counts(&self) -> std::collections::HashMap<Tier, u64> {
        self.metrics
            .tier_decisions
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }
}

fn match_override(
    config: &RoutingConfigDocument,
    query: &str,
) -> Option<crate::types::Override> {
    for over in &config.overrides {
        if let Ok(re) = regex::Regex::new(&over.pattern) {
            if re.is_match(query) {
                return Some(over.clone());
            }
        }
    }
    None
}
