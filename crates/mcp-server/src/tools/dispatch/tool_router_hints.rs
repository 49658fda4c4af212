use rmcp::handler::server::tool::{ToolCallContext, ToolRouter};
use rmcp::model::{CallToolResult, ErrorCode, JsonObject, Tool};
use rmcp::ErrorData;
use serde_json::{json, Map, Value};
use std::borrow::Cow;

use super::SonarMcpService;

const MAX_MESSAGE_LEN: usize = 900;

/// Generated router plus two protocol-level refinements: unknown tools are
/// `METHOD_NOT_FOUND`, and `INVALID_PARAMS` carries the required fields and an example call.
#[derive(Clone)]
pub(super) struct ToolRouterWithParamHints<S> {
    inner: ToolRouter<S>,
}

impl<S> ToolRouterWithParamHints<S>
where
    S: Send + Sync + 'static,
{
    pub(super) fn new(inner: ToolRouter<S>) -> Self {
        Self { inner }
    }

    pub(super) fn list_all(&self) -> Vec<Tool> {
        self.inner.list_all()
    }
}

impl ToolRouterWithParamHints<SonarMcpService> {
    pub(super) async fn call(
        &self,
        context: ToolCallContext<'_, SonarMcpService>,
    ) -> Result<CallToolResult, ErrorData> {
        let tool_name = context.name.to_string();
        if !self.inner.map.contains_key(tool_name.as_str()) {
            return Err(unknown_tool(&self.inner, &tool_name));
        }
        let args = context.arguments.clone();

        match self.inner.call(context).await {
            Ok(result) => Ok(result),
            Err(err) => Err(enrich_invalid_params(
                &self.inner,
                &tool_name,
                args.as_ref(),
                err,
            )),
        }
    }
}

fn unknown_tool<S>(router: &ToolRouter<S>, tool_name: &str) -> ErrorData {
    let mut available: Vec<String> = router.map.keys().map(ToString::to_string).collect();
    available.sort();
    log::debug!("call to unknown tool '{tool_name}'");
    ErrorData::new(
        ErrorCode::METHOD_NOT_FOUND,
        format!("Unknown tool '{tool_name}'"),
        Some(json!({ "tool": tool_name, "available": available })),
    )
}

fn enrich_invalid_params<S>(
    router: &ToolRouter<S>,
    tool_name: &str,
    args: Option<&JsonObject>,
    mut err: ErrorData,
) -> ErrorData {
    if err.code != ErrorCode::INVALID_PARAMS {
        return err;
    }

    let schema = router
        .map
        .get(tool_name)
        .map(|route| route.attr.input_schema.as_ref());
    let hint = schema.and_then(|schema| build_schema_hint(schema, args, err.message.as_ref()));

    let mut message = format!("Invalid parameters for tool '{tool_name}': {}", err.message);
    if let Some(hint) = hint.as_deref() {
        message.push_str(" Hint: ");
        message.push_str(hint);
    }
    if message.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push('…');
    }

    if err.data.is_none() {
        if let Some(required) = schema.map(required_fields).filter(|r| !r.is_empty()) {
            err.data = Some(json!({
                "tool": tool_name,
                "required": required,
            }));
        }
    }

    err.message = Cow::Owned(message);
    err
}

fn required_fields(schema: &Map<String, Value>) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn build_schema_hint(
    schema: &Map<String, Value>,
    args: Option<&JsonObject>,
    err_message: &str,
) -> Option<String> {
    let required = required_fields(schema);
    let missing = extract_serde_field(err_message, "missing field `");
    let unknown = extract_serde_field(err_message, "unknown field `");
    if required.is_empty() && unknown.is_none() {
        return None;
    }

    let mut out = String::new();
    if let Some(missing) = missing.as_deref() {
        out.push_str(&format!("missing required field `{missing}`. "));
    }
    if let Some(unknown) = unknown.as_deref() {
        out.push_str(&format!("unknown field `{unknown}`. "));
    }
    if !required.is_empty() {
        out.push_str(&format!("Required: {}.", required.join(", ")));
        if let Some(example) = build_required_example(schema, args, &required) {
            out.push_str(&format!(" Example: {example}"));
        }
    } else if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        let mut known: Vec<&str> = props.keys().map(String::as_str).collect();
        known.sort_unstable();
        out.push_str(&format!("Accepted: {}.", known.join(", ")));
    }
    Some(out.trim_end().to_string())
}

fn extract_serde_field(message: &str, prefix: &str) -> Option<String> {
    let start = message.find(prefix)? + prefix.len();
    let rest = &message[start..];
    let end = rest.find('`')?;
    let field = rest[..end].trim();
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

fn build_required_example(
    schema: &Map<String, Value>,
    args: Option<&JsonObject>,
    required: &[String],
) -> Option<String> {
    let props = schema.get("properties").and_then(Value::as_object);
    let mut out = Map::new();

    for field in required.iter().take(4) {
        let prop_schema = props.and_then(|m| m.get(field));
        out.insert(field.clone(), placeholder_value(field, prop_schema, args));
    }

    serde_json::to_string(&Value::Object(out)).ok()
}

fn placeholder_value(field: &str, schema: Option<&Value>, args: Option<&JsonObject>) -> Value {
    match field {
        "path" => return Value::String("src/index.js".to_string()),
        "key" => return Value::String("javascript:S1135".to_string()),
        // Common slip: `code` or `source` instead of `content`.
        "content" => {
            let given = args.and_then(|a| a.get("code").or_else(|| a.get("source")));
            if let Some(value) = given.and_then(Value::as_str) {
                if !value.trim().is_empty() {
                    return Value::String(value.to_string());
                }
            }
        }
        _ => {}
    }

    if let Some(schema) = schema {
        if let Some(value) = schema.get("default") {
            return value.clone();
        }
        if let Some(value) = schema
            .get("enum")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
        {
            return value.clone();
        }

        if let Some(ty) = schema.get("type").and_then(Value::as_str) {
            return match ty {
                "integer" | "number" => Value::Number(0.into()),
                "boolean" => Value::Bool(false),
                "array" => Value::Array(Vec::new()),
                "object" => Value::Object(Map::new()),
                _ => Value::String("...".to_string()),
            };
        }
    }

    Value::String("...".to_string())
}
