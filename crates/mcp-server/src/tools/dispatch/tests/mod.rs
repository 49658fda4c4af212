use super::router;
use super::SonarMcpService;
use crate::backend::Supervisor;
use crate::engine_stub::StubBehavior;
use crate::session::{SessionConfig, SessionManager, ToolInvocation};
use crate::test_support::{fast_supervisor_config, stub_plugin_set, StubLauncher};
use crate::tools::catalog::TOOL_CATALOG;
use crate::tools::schemas::analyze::{AnalyzeFileRequest, AnalyzeSnippetRequest};
use crate::tools::schemas::rules::ShowRuleRequest;
use pretty_assertions::assert_eq;
use rmcp::model::CallToolResult;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    service: SonarMcpService,
    launcher: Arc<StubLauncher>,
    dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(StubLauncher::new(StubBehavior::default()));
    let supervisor = Supervisor::new(
        fast_supervisor_config(),
        launcher.clone(),
        stub_plugin_set(dir.path()),
    );
    supervisor.start().await.unwrap();
    let service = SonarMcpService::new(SessionManager::new(supervisor, SessionConfig::default()));
    Harness {
        service,
        launcher,
        dir,
    }
}

fn invocation(tool: &str) -> ToolInvocation {
    ToolInvocation::new(tool, "7", Duration::from_secs(5), CancellationToken::new())
}

fn structured(result: &CallToolResult) -> &Value {
    result.structured_content.as_ref().unwrap()
}

fn error_code(result: &CallToolResult) -> &str {
    assert_eq!(result.is_error, Some(true));
    structured(result)["error"]["code"].as_str().unwrap()
}

#[test]
fn published_tools_match_the_catalog() {
    let tools = SonarMcpService::tool_definitions();
    let mut names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
    names.sort();
    let mut expected: Vec<String> = TOOL_CATALOG.iter().map(|t| t.name.to_string()).collect();
    expected.sort();
    assert_eq!(names, expected);

    let analyze = tools.iter().find(|t| t.name == "analyze_file").unwrap();
    let required = analyze.input_schema.get("required").unwrap();
    assert_eq!(required, &serde_json::json!(["path"]));
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_backend() {
    let h = harness().await;

    let missing = router::analyze::analyze_file(
        &h.service,
        &invocation("analyze_file"),
        AnalyzeFileRequest {
            path: h.dir.path().join("nope.js").display().to_string(),
            profile: None,
            language: None,
            timeout_ms: None,
        },
    )
    .await;
    assert_eq!(error_code(&missing), "validation");

    let shouting = router::analyze::analyze_code_snippet(
        &h.service,
        &invocation("analyze_code_snippet"),
        AnalyzeSnippetRequest {
            content: "let a = 1;".to_string(),
            language: Some("JS".to_string()),
            file_name: None,
            profile: None,
            timeout_ms: None,
        },
    )
    .await;
    assert_eq!(error_code(&shouting), "validation");

    let bad_key = router::rules::show_rule(
        &h.service,
        &invocation("show_rule"),
        ShowRuleRequest {
            key: "S1135".to_string(),
            timeout_ms: None,
        },
    )
    .await;
    assert_eq!(error_code(&bad_key), "validation");

    assert_eq!(h.launcher.counters.submits.load(Ordering::SeqCst), 0);
    assert_eq!(h.launcher.counters.rule_listings.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn analyze_file_reports_sorted_issues() {
    let h = harness().await;
    let file = h.dir.path().join("app.js");
    std::fs::write(&file, "console.log(1);\n// TODO later\n").unwrap();

    let result = router::analyze::analyze_file(
        &h.service,
        &invocation("analyze_file"),
        AnalyzeFileRequest {
            path: file.display().to_string(),
            profile: None,
            language: None,
            timeout_ms: None,
        },
    )
    .await;
    assert_eq!(result.is_error, Some(false));
    let output = structured(&result);
    assert_eq!(output["status"], "COMPLETE");
    assert_eq!(output["issue_count"], 2);
    let rules: Vec<&str> = output["issues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["rule_key"].as_str().unwrap())
        .collect();
    assert_eq!(rules, vec!["javascript:S106", "javascript:S1135"]);
    assert!(output.get("deduplicated").is_none());
}

#[tokio::test]
async fn show_rule_finds_known_keys_only() {
    let h = harness().await;

    let found = router::rules::show_rule(
        &h.service,
        &invocation("show_rule"),
        ShowRuleRequest {
            key: "javascript:S2068".to_string(),
            timeout_ms: None,
        },
    )
    .await;
    assert_eq!(structured(&found)["rule"]["severity"], "BLOCKER");

    let missing = router::rules::show_rule(
        &h.service,
        &invocation("show_rule"),
        ShowRuleRequest {
            key: "javascript:S9999".to_string(),
            timeout_ms: None,
        },
    )
    .await;
    assert_eq!(error_code(&missing), "not_found");
}

#[tokio::test]
async fn status_snapshot_needs_no_backend_call() {
    let h = harness().await;
    let result = router::status::backend_status(&h.service);
    let output = structured(&result);
    assert_eq!(output["backend"]["state"], "READY");
    assert_eq!(output["session"]["max_in_flight"], 1);
    assert_eq!(output["server"]["name"], "sonar-mcp");
    assert_eq!(output["plugins"]["languages"].as_array().unwrap().len(), 5);
}
