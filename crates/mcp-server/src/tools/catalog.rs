use serde_json::json;

#[derive(Clone, Copy, Debug)]
pub(crate) struct ToolDescriptor {
    pub(crate) name: &'static str,
    pub(crate) summary: &'static str,
}

pub(crate) const TOOL_CATALOG: &[ToolDescriptor] = &[
    ToolDescriptor {
        name: "analyze_file",
        summary: "Analyze one file on disk; returns issues sorted by file and line.",
    },
    ToolDescriptor {
        name: "analyze_code_snippet",
        summary: "Analyze source text without touching the filesystem.",
    },
    ToolDescriptor {
        name: "list_rules",
        summary: "Rules known to the engine (filter by language or profile).",
    },
    ToolDescriptor {
        name: "show_rule",
        summary: "One rule by `repository:rule` key.",
    },
    ToolDescriptor {
        name: "get_quality_profile",
        summary: "Quality profile with its active rules.",
    },
    ToolDescriptor {
        name: "backend_status",
        summary: "Backend state, restart counters, queue and plugin diagnostics.",
    },
];

pub(crate) fn tool_inventory_json(version: &str) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = TOOL_CATALOG
        .iter()
        .map(|tool| json!({ "name": tool.name, "summary": tool.summary }))
        .collect();

    json!({
        "binary": "sonar-mcp",
        "version": version,
        "count": tools.len(),
        "tools": tools,
    })
}

pub(crate) fn tool_instructions() -> String {
    let mut lines = vec![
        "Sonar MCP runs SonarLint analyzers locally through a supervised analysis backend.".to_string(),
        "Errors carry a stable `code`; `backend_unavailable` and `process_crash` are retryable after `retry_after_ms`."
            .to_string(),
        "Tools:".to_string(),
    ];
    for tool in TOOL_CATALOG {
        lines.push(format!("- {}: {}", tool.name, tool.summary));
    }
    lines.join("\n")
}
