use crate::error::BridgeError;
use crate::session::ToolInvocation;
use rmcp::model::{CallToolResult, Content};
use serde_json::json;
use sonar_mcp_protocol::ErrorEnvelope;

fn render_details_value(value: &serde_json::Value, max_len: usize) -> String {
    match value {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => {
            let mut out = s.split_whitespace().collect::<Vec<_>>().join(" ");
            if out.len() > max_len {
                let mut cut = max_len;
                while !out.is_char_boundary(cut) {
                    cut -= 1;
                }
                out.truncate(cut);
                out.push('…');
            }
            out
        }
        serde_json::Value::Array(values) => format!("<array len={}>", values.len()),
        serde_json::Value::Object(values) => format!("<object keys={}>", values.len()),
    }
}

fn render_details_notes(details: &serde_json::Value) -> Vec<String> {
    const MAX_LINES: usize = 8;
    const MAX_VALUE_CHARS: usize = 200;

    match details {
        serde_json::Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();

            let mut out = Vec::new();
            for key in keys.into_iter().take(MAX_LINES) {
                if let Some(value) = map.get(key) {
                    out.push(format!(
                        "details.{key}={}",
                        render_details_value(value, MAX_VALUE_CHARS)
                    ));
                }
            }
            if map.len() > MAX_LINES {
                out.push(format!("details.more_keys={}", map.len() - MAX_LINES));
            }
            out
        }
        other => vec![format!("details={}", render_details_value(other, 400))],
    }
}

/// Error result: a short text rendering plus the envelope as structured content.
pub(in crate::tools::dispatch) fn tool_error_envelope(error: ErrorEnvelope) -> CallToolResult {
    let mut lines = vec![format!("error: {}", error.code), error.message.clone()];
    if let Some(hint) = error.hint.as_deref() {
        if !hint.trim().is_empty() {
            lines.push(format!("hint: {hint}"));
        }
    }
    if let Some(retry_after_ms) = error.retry_after_ms {
        lines.push(format!("retry_after_ms: {retry_after_ms}"));
    }
    if let Some(details) = error.details.as_ref() {
        lines.extend(render_details_notes(details));
    }

    let mut result = CallToolResult::error(vec![Content::text(lines.join("\n"))]);
    result.structured_content = Some(json!({ "error": error }));
    result
}

pub(in crate::tools::dispatch) fn tool_error(
    invocation: &ToolInvocation,
    error: &BridgeError,
) -> CallToolResult {
    match error {
        BridgeError::Validation(_) | BridgeError::Cancelled => log::debug!(
            "{} {}: {error}",
            invocation.tool_name,
            invocation.request_id
        ),
        _ => log::warn!(
            "{} {} failed: {error}",
            invocation.tool_name,
            invocation.request_id
        ),
    }
    tool_error_envelope(error.to_envelope())
}

pub(in crate::tools::dispatch) fn internal_error(message: impl Into<String>) -> CallToolResult {
    tool_error_envelope(ErrorEnvelope::new("internal", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_render_sorted_and_bounded() {
        let notes = render_details_notes(&json!({ "b": "x  y", "a": [1, 2], "c": { "k": 1 } }));
        assert_eq!(
            notes,
            vec!["details.a=<array len=2>", "details.b=x y", "details.c=<object keys=1>"]
        );
    }

    #[test]
    fn envelope_is_marked_as_error_with_structured_payload() {
        let result = tool_error_envelope(BridgeError::unavailable("restarting").to_envelope());
        assert_eq!(result.is_error, Some(true));
        let structured = result.structured_content.unwrap();
        assert_eq!(structured["error"]["code"], "backend_unavailable");
        assert_eq!(structured["error"]["retryable"], true);
    }
}
