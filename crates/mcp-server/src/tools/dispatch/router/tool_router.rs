use super::super::tool_router_hints::ToolRouterWithParamHints;
use super::super::SonarMcpService;
use crate::tools::schemas::analyze::{AnalyzeFileRequest, AnalyzeSnippetRequest};
use crate::tools::schemas::profile::GetQualityProfileRequest;
use crate::tools::schemas::rules::{ListRulesRequest, ShowRuleRequest};
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{tool, tool_router, ErrorData as McpError};

pub(super) fn build_tool_router_with_param_hints() -> ToolRouterWithParamHints<SonarMcpService> {
    ToolRouterWithParamHints::new(SonarMcpService::tool_router())
}

#[tool_router]
impl SonarMcpService {
    /// Analyze one file on disk.
    #[tool(
        description = "Analyze a file with the local SonarLint engine. Returns `status` (COMPLETE/PARTIAL/FAILED), `issue_count` and `issues` sorted by file, line and column. Identical concurrent requests share one analysis."
    )]
    pub async fn analyze_file(
        &self,
        Parameters(request): Parameters<AnalyzeFileRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let invocation = self.invocation("analyze_file", &context, request.timeout_ms);
        Ok(super::analyze::analyze_file(self, &invocation, request).await)
    }

    /// Analyze in-memory source text.
    #[tool(
        description = "Analyze a code snippet (up to 1 MiB) without writing it to disk. Provide `language` or a `file_name` with a recognizable extension."
    )]
    pub async fn analyze_code_snippet(
        &self,
        Parameters(request): Parameters<AnalyzeSnippetRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let invocation = self.invocation("analyze_code_snippet", &context, request.timeout_ms);
        Ok(super::analyze::analyze_code_snippet(self, &invocation, request).await)
    }

    #[tool(
        description = "List the rules the analysis engine knows, optionally only one language's or only those active in a quality profile."
    )]
    pub async fn list_rules(
        &self,
        Parameters(request): Parameters<ListRulesRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let invocation = self.invocation("list_rules", &context, request.timeout_ms);
        Ok(super::rules::list_rules(self, &invocation, request).await)
    }

    #[tool(description = "Show one rule by its `repository:rule` key, e.g. 'javascript:S1135'.")]
    pub async fn show_rule(
        &self,
        Parameters(request): Parameters<ShowRuleRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let invocation = self.invocation("show_rule", &context, request.timeout_ms);
        Ok(super::rules::show_rule(self, &invocation, request).await)
    }

    #[tool(description = "Get a quality profile and its active rules by profile key.")]
    pub async fn get_quality_profile(
        &self,
        Parameters(request): Parameters<GetQualityProfileRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let invocation = self.invocation("get_quality_profile", &context, request.timeout_ms);
        Ok(super::profile::get_quality_profile(self, &invocation, request).await)
    }

    /// Supervisor and session diagnostics.
    #[tool(
        description = "Report the analysis backend state (READY/DEGRADED/...), restart counters, recent transitions, queue occupancy and provisioned plugins. Never calls the backend."
    )]
    pub async fn backend_status(&self) -> Result<CallToolResult, McpError> {
        Ok(super::status::backend_status(self))
    }
}
