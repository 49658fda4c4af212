// Per-tool dispatch functions used by the MCP tool router.

pub(super) mod analyze;
pub(super) mod error;
pub(super) mod profile;
pub(super) mod rules;
pub(super) mod status;
mod tool_router;

use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

pub(super) fn build_tool_router_with_param_hints(
) -> super::tool_router_hints::ToolRouterWithParamHints<super::SonarMcpService> {
    tool_router::build_tool_router_with_param_hints()
}

/// Pretty JSON text block plus the same value as structured content.
pub(super) fn json_result<T: Serialize>(value: &T) -> CallToolResult {
    match serde_json::to_value(value) {
        Ok(structured) => {
            let text = serde_json::to_string_pretty(&structured).unwrap_or_default();
            let mut result = CallToolResult::success(vec![Content::text(text)]);
            result.structured_content = Some(structured);
            result
        }
        Err(err) => error::internal_error(format!("failed to serialize tool result: {err}")),
    }
}
