use super::super::SonarMcpService;
use super::error::{tool_error, tool_error_envelope};
use super::json_result;
use crate::session::ToolInvocation;
use crate::tools::schemas::rules::{ListRulesRequest, RuleOutput, RulesOutput, ShowRuleRequest};
use crate::tools::validate;
use rmcp::model::CallToolResult;
use serde_json::json;
use sonar_mcp_protocol::backend::ListRulesParams;
use sonar_mcp_protocol::{error_codes, ErrorEnvelope};

pub(in crate::tools::dispatch) async fn list_rules(
    service: &SonarMcpService,
    invocation: &ToolInvocation,
    request: ListRulesRequest,
) -> CallToolResult {
    let params = match validate::language(request.language, &service.supervisor().languages())
        .and_then(|language| {
            Ok(ListRulesParams {
                language,
                profile: validate::optional("profile", request.profile)?,
            })
        }) {
        Ok(params) => params,
        Err(err) => return tool_error(invocation, &err),
    };

    match service.session().list_rules(invocation, params).await {
        Ok(rules) => json_result(&RulesOutput {
            rule_count: rules.len(),
            rules,
        }),
        Err(err) => tool_error(invocation, &err),
    }
}

pub(in crate::tools::dispatch) async fn show_rule(
    service: &SonarMcpService,
    invocation: &ToolInvocation,
    request: ShowRuleRequest,
) -> CallToolResult {
    let key = match validate::rule_key(&request.key) {
        Ok(key) => key,
        Err(err) => return tool_error(invocation, &err),
    };

    let rules = match service
        .session()
        .list_rules(invocation, ListRulesParams::default())
        .await
    {
        Ok(rules) => rules,
        Err(err) => return tool_error(invocation, &err),
    };
    match rules.into_iter().find(|rule| rule.key == key) {
        Some(rule) => json_result(&RuleOutput { rule }),
        None => tool_error_envelope(
            ErrorEnvelope::new(error_codes::NOT_FOUND, format!("Rule '{key}' not found"))
                .with_details(json!({ "key": key }))
                .with_hint("Use list_rules to see the keys the engine knows."),
        ),
    }
}
