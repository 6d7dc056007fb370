use crate::types::{Request, Rule, RuleKind, RoutingDecision, Tier};

/// Evaluates a single rule against a request, returning `None` when the rule
/// does not apply (no hit, or the keyword/mapping set is empty).
pub fn evaluate(rule: &Rule, request: &Request) -> Option<RoutingDecision> {
    if !rule.enabled {
        return None;
    }
    match &rule.kind {
        RuleKind::LengthThreshold { thresholds } => {
            evaluate_length(rule, thresholds, request)
        }
        RuleKind::ComplexityKeyword { indicators } => evaluate_complexity(rule, indicators, request),
        RuleKind::TaskType { mappings } => evaluate_task_type(rule, mappings, request),
    }
}

fn token_estimate(request: &Request) -> u32 {
    let text_tokens = (request.query_text.len() as u32).div_ceil(4);
    text_tokens + request.retrieved_context_tokens
}

fn evaluate_length(
    rule: &Rule,
    thresholds: &crate::types::RuleThresholds,
    request: &Request,
) -> Option<RoutingDecision> {
    let estimate = token_estimate(request);

    let (tier, midpoint, width) = if estimate <= thresholds.small_max {
        (Tier::Small, thresholds.small_max as f32 / 2.0, thresholds.small_max as f32)
    } else if estimate <= thresholds.medium_max {
        let width = (thresholds.medium_max - thresholds.small_max) as f32;
        let midpoint = thresholds.small_max as f32 + width / 2.0;
        (Tier::Medium, midpoint, width)
    } else {
        // No upper bound for "large"; treat the medium threshold as the
        // reference point so confidence still degrades gracefully far above it.
        let width = thresholds.medium_max as f32;
        (Tier::Large, thresholds.medium_max as f32, width)
    };

    let distance = (estimate as f32 - midpoint).abs();
    let confidence = if width > 0.0 {
        (1.0 - distance / width).clamp(0.6, 0.95)
    } else {
        0.6
    };

    Some(RoutingDecision {
        tier,
        confidence,
        reason: format!("length_based: token estimate {estimate} routed to {tier}"),
        rules_applied: vec![rule.name.clone()],
    })
}

fn evaluate_complexity(
    rule: &Rule,
    indicators: &crate::types::ComplexityIndicators,
    request: &Request,
) -> Option<RoutingDecision> {
    let query = request.query_text.to_lowercase();
    let count_hits = |keywords: &[String]| -> u32 {
        keywords.iter().filter(|kw| query.contains(kw.as_str())).count() as u32
    };

    let simple_hits = count_hits(&indicators.simple);
    let moderate_hits = count_hits(&indicators.moderate);
    let complex_hits = count_hits(&indicators.complex);

    let (tier, hits) = if complex_hits > 0 {
        (Tier::Large, complex_hits)
    } else if moderate_hits > 0 {
        (Tier::Medium, moderate_hits)
    } else if simple_hits > 0 {
        (Tier::Small, simple_hits)
    } else {
        return None;
    };

    let confidence = (0.6 + 0.1 * hits as f32).min(0.9);

    Some(RoutingDecision {
        tier,
        confidence,
        reason: format!("complexity_based: {hits} keyword hit(s) for {tier}"),
        rules_applied: vec![rule.name.clone()],
    })
}

fn evaluate_task_type(
    rule: &Rule,
    mappings: &crate::types::TaskMappings,
    request: &Request,
) -> Option<RoutingDecision> {
    let tier = *mappings.mappings.get(&request.method)?;
    Some(RoutingDecision {
        tier,
        confidence: 0.95,
        reason: format!("task_type: method '{}' maps to {tier}", request.method),
        rules_applied: vec![rule.name.clone()],
    })
}
