use super::super::SonarMcpService;
use super::error::tool_error;
use super::json_result;
use crate::session::ToolInvocation;
use crate::tools::schemas::profile::{GetQualityProfileRequest, QualityProfileOutput};
use crate::tools::validate;
use rmcp::model::CallToolResult;

pub(in crate::tools::dispatch) async fn get_quality_profile(
    service: &SonarMcpService,
    invocation: &ToolInvocation,
    request: GetQualityProfileRequest,
) -> CallToolResult {
    let key = match validate::required("key", &request.key) {
        Ok(key) => key,
        Err(err) => return tool_error(invocation, &err),
    };
    match service.session().fetch_profile(invocation, key).await {
        Ok(profile) => json_result(&QualityProfileOutput {
            active_rule_count: profile.active_rules.len(),
            profile,
        }),
        Err(err) => tool_error(invocation, &err),
    }
}
