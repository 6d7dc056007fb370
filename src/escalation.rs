use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;

use crate::types::{Override, Request, Session, Tier};

/// Matches an inline `@small`/`@medium`/`@large` hint anywhere in query text,
/// case-insensitively and word-bounded.
fn hint_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)@(small|medium|large)\b").expect("valid regex"))
}

/// Strips the first inline hint token from `query`, returning the cleaned
/// text and the tier it named, if any. The hint is removed regardless of
/// which precedence level ultimately decides the tier, so downstream
/// components never see the raw token.
pub fn extract_inline_hint(query: &str) -> (String, Option<Tier>) {
    match hint_pattern().find(query) {
        Some(m) => {
            let tier = query[m.start() + 1..m.end()]
                .to_lowercase()
                .parse()
                .ok();
            let mut cleaned = String::with_capacity(query.len());
            cleaned.push_str(&query[..m.start()]);
            cleaned.push_str(&query[m.end()..]);
            (cleaned.split_whitespace().collect::<Vec<_>>().join(" "), tier)
        }
        None => (query.to_string(), None),
    }
}

#[derive(Clone)]
pub struct EscalationResolver {
    sessions: Arc<DashMap<String, Session>>,
}

impl Default for EscalationResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationResolver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Resolves the escalation override, if any, applying strict precedence:
    /// (1) explicit `preferred_tier`, (2) an active session override, (3) an
    /// inline `@tier` hint. The inline hint is stripped from `request.query_text`
    /// as a side effect whenever one is present, independent of which level wins.
    pub fn resolve(&self, request: &mut Request) -> Option<Override> {
        let (cleaned, inline_tier) = extract_inline_hint(&request.query_text);
        request.query_text = cleaned;

        if let Some(tier) = request.preferred_tier {
            return Some(Override {
                pattern: String::new(),
                tier,
                reason: "explicit preferred_tier on request".into(),
            });
        }

        if let Some(session_id) = &request.session_id {
            if let Some(tier) = self.active_session_override(session_id) {
                return Some(Override {
                    pattern: String::new(),
                    tier,
                    reason: format!("active session override for {session_id}"),
                });
            }
        }

        inline_tier.map(|tier| Override {
            pattern: String::new(),
            tier,
            reason: "inline @tier hint".into(),
        })
    }

    fn active_session_override(&self, session_id: &str) -> Option<Tier> {
        let mut expired = false;
        let result = self.sessions.get(session_id).and_then(|session| {
            match (session.override_tier, session.override_expires_at) {
                (Some(tier), Some(expires_at)) if Utc::now() < expires_at => Some(tier),
                (Some(_), Some(_)) => {
                    expired = true;
                    None
                }
                _ => None,
            }
        });
        if expired {
            self.sessions.remove(session_id);
        }
        result
    }

    pub fn apply_session_override(
        &self,
        session_id: impl Into<String>,
        tier: Tier,
        duration: Option<Duration>,
    ) {
        let session_id = session_id.into();
        let expires_at = duration.map(|d| Utc::now() + d);
        self.sessions.insert(
            session_id.clone(),
            Session {
                id: session_id,
                override_tier: Some(tier),
                override_expires_at: expires_at,
            },
        );
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn session_expiry(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.override_expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_hint_is_stripped_and_parsed() {
        let (cleaned, tier) = extract_inline_hint("@medium refactor this helper");
        assert_eq!(cleaned, "refactor this helper");
        assert_eq!(tier, Some(Tier::Medium));
    }

    #[test]
    fn query_without_hint_is_untouched() {
        let (cleaned, tier) = extract_inline_hint("plain query text");
        assert_eq!(cleaned, "plain query text");
        assert_eq!(tier, None);
    }

    #[test]
    fn explicit_preferred_tier_wins_over_session_and_hint() {
        let resolver = EscalationResolver::new();
        resolver.apply_session_override("s1", Tier::Large, Some(Duration::seconds(60)));
        let mut request = Request {
            preferred_tier: Some(Tier::Small),
            session_id: Some("s1".into()),
            query_text: "@medium do something".into(),
            ..Default::default()
        };
        let resolved = resolver.resolve(&mut request).unwrap();
        assert_eq!(resolved.tier, Tier::Small);
        assert_eq!(request.query_text, "do something");
    }

    #[test]
    fn session_override_wins_over_inline_hint() {
        let resolver = EscalationResolver::new();
        resolver.apply_session_override("s1", Tier::Large, Some(Duration::seconds(60)));
        let mut request = Request {
            session_id: Some("s1".into()),
            query_text: "@medium do something".into(),
            ..Default::default()
        };
        let resolved = resolver.resolve(&mut request).unwrap();
        assert_eq!(resolved.tier, Tier::Large);
    }

    #[test]
    fn expired_session_override_falls_through_to_inline_hint() {
        let resolver = EscalationResolver::new();
        resolver.apply_session_override("s1", Tier::Large, Some(Duration::seconds(-1)));
        let mut request = Request {
            session_id: Some("s1".into()),
            query_text: "@medium do something".into(),
            ..Default::default()
        };
        let resolved = resolver.resolve(&mut request).unwrap();
        assert_eq!(resolved.tier, Tier::Medium);
    }
}
