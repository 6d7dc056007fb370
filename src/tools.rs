use serde::Serialize;
use serde_json::{json, Value};

/// One entry of the `tools/list` result: a name, a human description, and a
/// JSON-schema `inputSchema` declaring required/optional parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The four tools that carry a coding question through routing, the
/// semantic cache, and a model backend.
pub const ROUTED_TOOLS: &[&str] = &["search_code", "explain_code", "find_similar", "get_context"];

/// The four introspection tools answered locally from process state, never
/// touching routing, the cache, or a model backend.
pub const LOCAL_TOOLS: &[&str] = &[
    "get_server_info",
    "signal_hub_health",
    "signal_hub_metrics",
    "signal_hub_system_info",
];

pub fn is_routed(name: &str) -> bool {
    ROUTED_TOOLS.contains(&name)
}

pub fn is_local(name: &str) -> bool {
    LOCAL_TOOLS.contains(&name)
}

fn query_schema(extra_description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": extra_description,
            },
            "context": {
                "type": "object",
                "description": "Optional retrieval context (e.g. file path) used as the cache's exact-match key",
            },
            "client_id": { "type": "string" },
            "session_id": { "type": "string" },
            "preferred_tier": { "type": "string", "enum": ["small", "medium", "large"] },
            "retrieved_context_tokens": { "type": "integer", "minimum": 0 },
        },
        "required": ["query"],
    })
}

/// The full tool catalog exposed through `tools/list`, in declaration order.
pub fn catalog() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "search_code",
            description: "Search the indexed source tree for code matching a natural-language query",
            input_schema: query_schema("What to search for"),
        },
        ToolDefinition {
            name: "explain_code",
            description: "Explain a piece of retrieved code in plain language",
            input_schema: query_schema("The code or question to explain"),
        },
        ToolDefinition {
            name: "find_similar",
            description: "Find code similar in shape or intent to the supplied snippet",
            input_schema: query_schema("The snippet or description to match against"),
        },
        ToolDefinition {
            name: "get_context",
            description: "Retrieve surrounding context for a file or symbol",
            input_schema: query_schema("The file, symbol, or question to gather context for"),
        },
        ToolDefinition {
            name: "get_server_info",
            description: "Return server identity and capability metadata",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "signal_hub_health",
            description: "Return liveness and per-tier backend availability",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "signal_hub_metrics",
            description: "Export the metrics registry in Prometheus or JSON form",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "format": { "type": "string", "enum": ["prometheus", "json"], "default": "json" }
                },
            }),
        },
        ToolDefinition {
            name: "signal_hub_system_info",
            description: "Return process uptime, configuration summary, and cache/ledger sizes",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
    ]
}

/// Wraps a tool result in the `tools/call` content envelope: a list of
/// typed content blocks, here always a single text block carrying the JSON
/// payload serialized as a string (matching `{content:[{type:"text", text}]}`).
pub fn text_content(payload: &Value) -> Value {
    json!({
        "content": [
            { "type": "text", "text": payload.to_string() }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_every_declared_tool_name() {
        let names: Vec<&str> = catalog().iter().map(|t| t.name).collect();
        for name in ROUTED_TOOLS.iter().chain(LOCAL_TOOLS.iter()) {
            assert!(names.contains(name), "missing tool definition for {name}");
        }
    }

    #[test]
    fn routed_and_local_sets_are_disjoint() {
        for name in ROUTED_TOOLS {
            assert!(!is_local(name));
        }
        for name in LOCAL_TOOLS {
            assert!(!is_routed(name));
        }
    }

    #[test]
    fn text_content_wraps_payload_as_stringified_json() {
        let wrapped = text_content(&json!({"a": 1}));
        assert_eq!(wrapped["content"][0]["type"], "text");
        assert_eq!(wrapped["content"][0]["text"], "{\"a\":1}");
    }
}
