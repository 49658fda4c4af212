//! Deterministic stand-in for the analysis engine, speaking the backend protocol.
//!
//! Used in-process by unit tests (over `tokio::io::duplex`) and as the
//! `sonar-mcp-engine-stub` binary by integration tests. It "analyzes" text with a handful of
//! line-based rules so results are stable across runs, and exposes fault injection: silent
//! heartbeats, crash on submit, slow analyses and an unreachable JS/TS bridge.

use crate::rpc::{FrameReader, FrameWriter};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sonar_mcp_protocol::backend::{
    error_codes, methods, notifications, AnalysisTarget, BridgeHealth, BridgeRestartResult,
    CancelParams, CompletedParams, CompletionStatus, GetProfileParams, GetProfileResult,
    InitializeParams, InitializeResult, IssuesParams, ListRulesParams, ListRulesResult,
    PingResult, RpcErrorObject, RpcFrame, RpcRequest, RpcResponse, SubmitAck, SubmitParams,
    BACKEND_PROTOCOL_VERSION,
};
use sonar_mcp_protocol::{
    ActiveRule, Issue, QualityProfile, RuleDescriptor, RuleType, Severity, TextRange,
};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const STUB_ENGINE_VERSION: &str = "stub-engine/1.0";
pub const DEFAULT_LANGUAGES: &[&str] = &["css", "java", "js", "py", "ts"];

const LONG_LINE_LIMIT: usize = 120;
const CRASH_EXIT_CODE: i32 = 70;

#[derive(Debug, Clone)]
pub struct StubBehavior {
    /// Never answer `health/ping`.
    pub silent_heartbeats: bool,
    /// Exit as soon as an analysis is submitted.
    pub crash_on_submit: bool,
    /// One-shot variant of `crash_on_submit`: crash if this file exists, removing it first.
    pub crash_marker: Option<PathBuf>,
    pub analysis_delay: Duration,
    pub bridge: BridgeHealth,
    pub bridge_restart_fixes: bool,
    pub protocol_version: u32,
    /// Appends one line per submitted analysis; lets other processes count submits.
    pub submit_log: Option<PathBuf>,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            silent_heartbeats: false,
            crash_on_submit: false,
            crash_marker: None,
            analysis_delay: Duration::ZERO,
            bridge: BridgeHealth::Up,
            bridge_restart_fixes: true,
            protocol_version: BACKEND_PROTOCOL_VERSION,
            submit_log: None,
        }
    }
}

impl StubBehavior {
    pub fn from_env() -> Self {
        let flag = |key: &str| {
            std::env::var(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };
        let path = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        let bridge = match std::env::var("SONAR_MCP_STUB_BRIDGE").as_deref().map(str::trim) {
            Ok("unreachable") => BridgeHealth::Unreachable,
            Ok("not_started") => BridgeHealth::NotStarted,
            _ => BridgeHealth::Up,
        };
        Self {
            silent_heartbeats: flag("SONAR_MCP_STUB_SILENT_HEARTBEATS"),
            crash_on_submit: flag("SONAR_MCP_STUB_CRASH_ON_SUBMIT"),
            crash_marker: path("SONAR_MCP_STUB_CRASH_MARKER"),
            analysis_delay: std::env::var("SONAR_MCP_STUB_ANALYSIS_DELAY_MS")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::ZERO),
            bridge,
            bridge_restart_fixes: !flag("SONAR_MCP_STUB_BRIDGE_RESTART_FAILS"),
            protocol_version: BACKEND_PROTOCOL_VERSION,
            submit_log: path("SONAR_MCP_STUB_SUBMIT_LOG"),
        }
    }
}

#[derive(Debug, Default)]
pub struct StubCounters {
    pub initializes: AtomicUsize,
    pub pings: AtomicUsize,
    pub submits: AtomicUsize,
    pub cancels: AtomicUsize,
    pub rule_listings: AtomicUsize,
    pub profile_fetches: AtomicUsize,
    pub bridge_restarts: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl StubCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubExit {
    Shutdown,
    Crashed,
    Disconnected,
}

/// Serves one engine session until shutdown, disconnect, an injected crash, or `kill`.
pub async fn serve_engine<R, W>(
    read: R,
    write: W,
    behavior: StubBehavior,
    counters: Arc<StubCounters>,
    kill: CancellationToken,
) -> std::io::Result<StubExit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = FrameWriter::spawn(write);
    let mut reader = FrameReader::new(read);
    let mut analyses: JoinSet<u64> = JoinSet::new();
    let mut running: HashMap<u64, CancellationToken> = HashMap::new();
    let mut bridge = behavior.bridge;
    let mut languages: Vec<String> = DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect();

    loop {
        while let Some(done) = analyses.try_join_next() {
            if let Ok(correlation_id) = done {
                running.remove(&correlation_id);
            }
        }

        let next = tokio::select! {
            _ = kill.cancelled() => return Ok(StubExit::Crashed),
            next = reader.next_frame() => next?,
        };
        let Some(frame) = next else {
            return Ok(StubExit::Disconnected);
        };
        let request = match frame {
            Ok(RpcFrame::Request(request)) => request,
            Ok(RpcFrame::Notification(note)) => {
                if note.method == methods::CANCEL {
                    StubCounters::bump(&counters.cancels);
                    if let Ok(params) = serde_json::from_value::<CancelParams>(note.params) {
                        if let Some(token) = running.remove(&params.correlation_id) {
                            token.cancel();
                        }
                    }
                }
                continue;
            }
            Ok(RpcFrame::Response(_)) => continue,
            Err(err) => {
                log::warn!("stub engine: {err}");
                continue;
            }
        };

        let id = request.id;
        let reply = match request.method.as_str() {
            methods::INITIALIZE => {
                StubCounters::bump(&counters.initializes);
                parse::<InitializeParams>(&request).map(|params| {
                    if !params.languages.is_empty() {
                        languages = params.languages;
                    }
                    to_value(InitializeResult {
                        protocol_version: behavior.protocol_version,
                        engine_version: STUB_ENGINE_VERSION.to_string(),
                        languages: languages.clone(),
                    })
                })
            }
            methods::PING => {
                StubCounters::bump(&counters.pings);
                if behavior.silent_heartbeats {
                    continue;
                }
                Ok(to_value(PingResult { bridge }))
            }
            methods::SUBMIT => {
                StubCounters::bump(&counters.submits);
                if let Some(log_path) = behavior.submit_log.as_ref() {
                    append_submit_log(log_path, &request.params);
                }
                if behavior.crash_on_submit || take_crash_marker(behavior.crash_marker.as_deref())
                {
                    log::warn!("stub engine: crashing on submit");
                    return Ok(StubExit::Crashed);
                }
                match parse::<SubmitParams>(&request) {
                    Ok(params) => {
                        let token = CancellationToken::new();
                        running.insert(params.correlation_id, token.clone());
                        analyses.spawn(run_analysis(
                            writer.clone(),
                            params,
                            languages.clone(),
                            behavior.analysis_delay,
                            token,
                        ));
                        Ok(to_value(SubmitAck { accepted: true }))
                    }
                    Err(err) => Err(err),
                }
            }
            methods::LIST_RULES => {
                StubCounters::bump(&counters.rule_listings);
                parse::<ListRulesParams>(&request)
                    .and_then(|params| list_rules(&languages, &params))
                    .map(|rules| to_value(ListRulesResult { rules }))
            }
            methods::GET_PROFILE => {
                StubCounters::bump(&counters.profile_fetches);
                parse::<GetProfileParams>(&request)
                    .and_then(|params| find_profile(&languages, &params.key))
                    .map(|profile| to_value(GetProfileResult { profile }))
            }
            methods::BRIDGE_RESTART => {
                StubCounters::bump(&counters.bridge_restarts);
                if behavior.bridge_restart_fixes {
                    bridge = BridgeHealth::Up;
                }
                Ok(to_value(BridgeRestartResult { bridge }))
            }
            methods::SHUTDOWN => {
                StubCounters::bump(&counters.shutdowns);
                let _ = writer
                    .send(&RpcFrame::Response(RpcResponse::ok(id, Value::Null)))
                    .await;
                return Ok(StubExit::Shutdown);
            }
            other => Err(RpcErrorObject::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Unknown method '{other}'"),
            )),
        };

        let response = match reply {
            Ok(result) => RpcResponse::ok(id, result),
            Err(error) => RpcResponse::err(id, error),
        };
        if writer.send(&RpcFrame::Response(response)).await.is_err() {
            return Ok(StubExit::Disconnected);
        }
    }
}

/// Entry point of the `sonar-mcp-engine-stub` binary: serves stdin/stdout, configured from env.
pub async fn run_stdio_from_env() -> Result<()> {
    let behavior = StubBehavior::from_env();
    let counters = Arc::new(StubCounters::default());
    let exit = serve_engine(
        tokio::io::stdin(),
        tokio::io::stdout(),
        behavior,
        counters,
        CancellationToken::new(),
    )
    .await?;
    if exit == StubExit::Crashed {
        std::process::exit(CRASH_EXIT_CODE);
    }
    Ok(())
}

fn parse<T: DeserializeOwned>(request: &RpcRequest) -> Result<T, RpcErrorObject> {
    serde_json::from_value(request.params.clone()).map_err(|err| {
        RpcErrorObject::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params for '{}': {err}", request.method),
        )
    })
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn take_crash_marker(marker: Option<&Path>) -> bool {
    match marker {
        Some(path) if path.exists() => std::fs::remove_file(path).is_ok(),
        _ => false,
    }
}

fn append_submit_log(path: &Path, params: &Value) {
    let line = params
        .get("target")
        .map(Value::to_string)
        .unwrap_or_default();
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        let _ = writeln!(file, "{line}");
    }
}

async fn run_analysis(
    writer: FrameWriter,
    params: SubmitParams,
    languages: Vec<String>,
    delay: Duration,
    cancel: CancellationToken,
) -> u64 {
    let correlation_id = params.correlation_id;
    let finish = |status: CompletionStatus, error: Option<RpcErrorObject>| {
        RpcFrame::notification(
            notifications::COMPLETED,
            to_value(CompletedParams {
                correlation_id,
                status,
                error,
            }),
        )
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            let frame = finish(
                CompletionStatus::Failed,
                Some(RpcErrorObject::new(error_codes::REQUEST_CANCELLED, "Analysis cancelled")),
            );
            let _ = writer.send(&frame).await;
            return correlation_id;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    let (text, display_path) = match &params.target {
        AnalysisTarget::File { path } => match tokio::fs::read_to_string(path).await {
            Ok(text) => (text, path.display().to_string()),
            Err(err) => {
                let frame = finish(
                    CompletionStatus::Failed,
                    Some(RpcErrorObject::new(
                        error_codes::ANALYSIS_FAILED,
                        format!("Cannot read '{}': {err}", path.display()),
                    )),
                );
                let _ = writer.send(&frame).await;
                return correlation_id;
            }
        },
        AnalysisTarget::Content { content, file_name } => (content.clone(), file_name.clone()),
    };

    let language = params
        .language
        .clone()
        .or_else(|| language_for_file(&display_path).map(ToString::to_string));
    let supported = language
        .as_deref()
        .is_some_and(|lang| languages.iter().any(|l| l == lang));

    let active = match params.profile.as_deref() {
        Some(key) => match find_profile(&languages, key) {
            Ok(profile) => Some(profile),
            Err(error) => {
                let _ = writer.send(&finish(CompletionStatus::Failed, Some(error))).await;
                return correlation_id;
            }
        },
        None => None,
    };

    let mut issues = analyze_text(&text, &display_path, language.as_deref());
    if let Some(profile) = active {
        issues.retain(|issue| {
            profile
                .active_rules
                .iter()
                .any(|rule| rule.rule_key == issue.rule_key)
        });
    }

    // Deliver out of order and with one repeat, like a real engine streaming per sensor.
    let mid = issues.len() / 2;
    let first: Vec<Issue> = issues[..mid].to_vec();
    let mut second: Vec<Issue> = issues[mid..].iter().rev().cloned().collect();
    if let Some(repeat) = issues.first() {
        second.push(repeat.clone());
    }
    for batch in [first, second] {
        if batch.is_empty() {
            continue;
        }
        let frame = RpcFrame::notification(
            notifications::ISSUES,
            to_value(IssuesParams {
                correlation_id,
                issues: batch,
            }),
        );
        if writer.send(&frame).await.is_err() {
            return correlation_id;
        }
    }

    let status = if supported {
        CompletionStatus::Complete
    } else {
        CompletionStatus::Partial
    };
    let _ = writer.send(&finish(status, None)).await;
    correlation_id
}

pub fn language_for_file(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let language = match ext.as_str() {
        "js" | "jsx" | "mjs" | "cjs" => "js",
        "ts" | "tsx" | "mts" | "cts" => "ts",
        "css" | "scss" | "less" => "css",
        "java" => "java",
        "py" => "py",
        "php" => "php",
        "html" | "htm" => "html",
        "xml" => "xml",
        "kt" | "kts" => "kotlin",
        "go" => "go",
        "rb" => "ruby",
        _ => return None,
    };
    Some(language)
}

fn repository(language: Option<&str>) -> &str {
    match language {
        Some("js") => "javascript",
        Some("ts") => "typescript",
        Some("py") => "python",
        Some(other) => other,
        None => "text",
    }
}

struct RuleTemplate {
    id: &'static str,
    name: &'static str,
    severity: Severity,
    rule_type: RuleType,
    description: &'static str,
    tags: &'static [&'static str],
    essential: bool,
}

const RULES: &[RuleTemplate] = &[
    RuleTemplate {
        id: "S103",
        name: "Lines should not be too long",
        severity: Severity::Minor,
        rule_type: RuleType::CodeSmell,
        description: "Having to scroll horizontally makes it harder to get a quick overview of code.",
        tags: &["convention"],
        essential: false,
    },
    RuleTemplate {
        id: "S106",
        name: "Standard outputs should not be used directly to log anything",
        severity: Severity::Major,
        rule_type: RuleType::CodeSmell,
        description: "Use a dedicated logger instead of printing to standard output.",
        tags: &["bad-practice"],
        essential: false,
    },
    RuleTemplate {
        id: "S1135",
        name: "Track uses of \"TODO\" tags",
        severity: Severity::Info,
        rule_type: RuleType::CodeSmell,
        description: "TODO tags are commonly used to mark places where some more code is required.",
        tags: &["cwe"],
        essential: true,
    },
    RuleTemplate {
        id: "S2068",
        name: "Hard-coded passwords are security-sensitive",
        severity: Severity::Blocker,
        rule_type: RuleType::Vulnerability,
        description: "Credentials should be stored outside of the code.",
        tags: &["cwe", "owasp-a2"],
        essential: true,
    },
];

fn rule_key(language: Option<&str>, id: &str) -> String {
    format!("{}:{id}", repository(language))
}

fn rules_for(language: &str) -> Vec<RuleDescriptor> {
    RULES
        .iter()
        .map(|rule| RuleDescriptor {
            key: rule_key(Some(language), rule.id),
            name: rule.name.to_string(),
            language: language.to_string(),
            severity: rule.severity,
            rule_type: rule.rule_type,
            description: Some(rule.description.to_string()),
            tags: rule.tags.iter().map(|t| t.to_string()).collect(),
        })
        .collect()
}

fn profiles_for(language: &str) -> Vec<QualityProfile> {
    let active = |essential_only: bool| {
        RULES
            .iter()
            .filter(|rule| !essential_only || rule.essential)
            .map(|rule| ActiveRule {
                rule_key: rule_key(Some(language), rule.id),
                severity: rule.severity,
                params: BTreeMap::new(),
            })
            .collect()
    };
    vec![
        QualityProfile {
            key: format!("stub-sonar-way-{language}"),
            name: "Sonar way".to_string(),
            language: language.to_string(),
            is_default: true,
            active_rules: active(false),
        },
        QualityProfile {
            key: format!("stub-essentials-{language}"),
            name: "Essentials".to_string(),
            language: language.to_string(),
            is_default: false,
            active_rules: active(true),
        },
    ]
}

fn find_profile(languages: &[String], key: &str) -> Result<QualityProfile, RpcErrorObject> {
    languages
        .iter()
        .flat_map(|lang| profiles_for(lang))
        .find(|profile| profile.key == key)
        .ok_or_else(|| {
            RpcErrorObject::new(
                error_codes::UNKNOWN_PROFILE,
                format!("Profile '{key}' not found"),
            )
        })
}

fn list_rules(
    languages: &[String],
    params: &ListRulesParams,
) -> Result<Vec<RuleDescriptor>, RpcErrorObject> {
    let selected: Vec<&String> = match params.language.as_deref() {
        Some(lang) => {
            let Some(found) = languages.iter().find(|l| l.as_str() == lang) else {
                return Err(RpcErrorObject::new(
                    error_codes::UNSUPPORTED_LANGUAGE,
                    format!("Language '{lang}' is not supported"),
                ));
            };
            vec![found]
        }
        None => languages.iter().collect(),
    };
    let mut rules: Vec<RuleDescriptor> = selected.into_iter().flat_map(|l| rules_for(l)).collect();
    if let Some(key) = params.profile.as_deref() {
        let profile = find_profile(languages, key)?;
        rules.retain(|rule| profile.active_rules.iter().any(|a| a.rule_key == rule.key));
    }
    rules.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(rules)
}

/// Line-based rules; issues come back in discovery order, not normalized.
pub fn analyze_text(text: &str, file_path: &str, language: Option<&str>) -> Vec<Issue> {
    let mut issues = Vec::new();
    let make = |id: &str, line: u32, start: usize, end: usize, message: String| {
        let severity = RULES
            .iter()
            .find(|rule| rule.id == id)
            .map(|rule| rule.severity)
            .unwrap_or(Severity::Info);
        Issue {
            rule_key: rule_key(language, id),
            file_path: file_path.to_string(),
            text_range: Some(TextRange {
                start_line: line,
                start_line_offset: start as u32,
                end_line: line,
                end_line_offset: end as u32,
            }),
            severity,
            message,
        }
    };

    for (index, raw) in text.lines().enumerate() {
        let line_no = index as u32 + 1;
        let width = raw.chars().count();
        if let Some(col) = raw.find("TODO") {
            issues.push(make(
                "S1135",
                line_no,
                col,
                col + 4,
                "Complete the task associated to this \"TODO\" comment.".to_string(),
            ));
        }
        let lower = raw.to_ascii_lowercase();
        if let Some(col) = lower.find("password =").or_else(|| lower.find("password=")) {
            issues.push(make(
                "S2068",
                line_no,
                col,
                col + "password".len(),
                "\"password\" detected here, make sure this is not a hard-coded credential."
                    .to_string(),
            ));
        }
        let output_call = ["console.log(", "System.out.print", "println!(", "print("]
            .iter()
            .find_map(|needle| raw.find(needle).map(|col| (col, needle.len())));
        if let Some((col, len)) = output_call {
            issues.push(make(
                "S106",
                line_no,
                col,
                col + len,
                "Replace this use of standard output by a logger.".to_string(),
            ));
        }
        if width > LONG_LINE_LIMIT {
            issues.push(make(
                "S103",
                line_no,
                0,
                width,
                format!(
                    "Split this {width} characters long line (which is greater than {LONG_LINE_LIMIT} authorized)."
                ),
            ));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_mcp_protocol::normalize_issues;

    #[test]
    fn finds_line_based_issues() {
        let text = "// TODO: remove\nconst password = \"hunter2\";\nconsole.log(x);\n";
        let issues = normalize_issues(analyze_text(text, "a.js", Some("js")));
        let keys: Vec<(&str, u32)> = issues
            .iter()
            .map(|i| (i.rule_key.as_str(), i.text_range.unwrap().start_line))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("javascript:S1135", 1),
                ("javascript:S2068", 2),
                ("javascript:S106", 3)
            ]
        );
        assert_eq!(issues[1].severity, Severity::Blocker);
    }

    #[test]
    fn essentials_profile_is_a_subset() {
        let langs = vec!["js".to_string()];
        let all = list_rules(&langs, &ListRulesParams::default()).unwrap();
        let essentials = list_rules(
            &langs,
            &ListRulesParams {
                language: Some("js".to_string()),
                profile: Some("stub-essentials-js".to_string()),
            },
        )
        .unwrap();
        assert_eq!(all.len(), RULES.len());
        assert_eq!(essentials.len(), 2);
        assert!(matches!(
            list_rules(
                &langs,
                &ListRulesParams {
                    language: Some("cobol".to_string()),
                    profile: None
                }
            ),
            Err(RpcErrorObject { code: error_codes::UNSUPPORTED_LANGUAGE, .. })
        ));
    }

    #[test]
    fn unknown_profile_uses_engine_error_code() {
        let err = find_profile(&["js".to_string()], "nope").unwrap_err();
        assert_eq!(err.code, error_codes::UNKNOWN_PROFILE);
        assert_eq!(err.message, "Profile 'nope' not found");
    }

    #[test]
    fn languages_follow_extensions() {
        assert_eq!(language_for_file("src/App.tsx"), Some("ts"));
        assert_eq!(language_for_file("Main.java"), Some("java"));
        assert_eq!(language_for_file("README"), None);
    }
}
