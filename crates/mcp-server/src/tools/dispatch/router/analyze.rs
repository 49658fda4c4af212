use super::super::SonarMcpService;
use super::error::tool_error;
use super::json_result;
use crate::error::Result;
use crate::rpc::AnalysisRequest;
use crate::session::ToolInvocation;
use crate::tools::schemas::analyze::{AnalysisOutput, AnalyzeFileRequest, AnalyzeSnippetRequest};
use crate::tools::validate;
use rmcp::model::CallToolResult;
use sonar_mcp_protocol::backend::AnalysisTarget;
use std::time::Instant;

pub(in crate::tools::dispatch) async fn analyze_file(
    service: &SonarMcpService,
    invocation: &ToolInvocation,
    request: AnalyzeFileRequest,
) -> CallToolResult {
    let prepared = prepare_file(service, request).await;
    run(service, invocation, prepared).await
}

pub(in crate::tools::dispatch) async fn analyze_code_snippet(
    service: &SonarMcpService,
    invocation: &ToolInvocation,
    request: AnalyzeSnippetRequest,
) -> CallToolResult {
    let prepared = prepare_snippet(service, request);
    run(service, invocation, prepared).await
}

async fn prepare_file(
    service: &SonarMcpService,
    request: AnalyzeFileRequest,
) -> Result<AnalysisRequest> {
    let path = validate::existing_file(&request.path).await?;
    let language = validate::language(request.language, &service.supervisor().languages())?;
    let profile = validate::optional("profile", request.profile)?;
    Ok(AnalysisRequest {
        target: AnalysisTarget::File { path },
        language,
        profile,
    })
}

fn prepare_snippet(
    service: &SonarMcpService,
    request: AnalyzeSnippetRequest,
) -> Result<AnalysisRequest> {
    validate::snippet(&request.content)?;
    let language = validate::language(request.language, &service.supervisor().languages())?;
    let file_name = validate::snippet_file_name(request.file_name, language.as_deref())?;
    let profile = validate::optional("profile", request.profile)?;
    Ok(AnalysisRequest {
        target: AnalysisTarget::Content {
            content: request.content,
            file_name,
        },
        language,
        profile,
    })
}

async fn run(
    service: &SonarMcpService,
    invocation: &ToolInvocation,
    prepared: Result<AnalysisRequest>,
) -> CallToolResult {
    let request = match prepared {
        Ok(request) => request,
        Err(err) => return tool_error(invocation, &err),
    };
    let target = request.target.display_path();
    let started = Instant::now();
    match service.session().analyze(invocation, request).await {
        Ok(outcome) => {
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            log::debug!(
                "{} {}: {} issue(s) in {target} ({elapsed_ms}ms)",
                invocation.tool_name,
                invocation.request_id,
                outcome.result.issues.len()
            );
            json_result(&AnalysisOutput {
                target,
                status: outcome.result.status,
                issue_count: outcome.result.issues.len(),
                issues: outcome.result.issues.clone(),
                deduplicated: outcome.deduplicated,
                elapsed_ms,
            })
        }
        Err(err) => tool_error(invocation, &err),
    }
}
