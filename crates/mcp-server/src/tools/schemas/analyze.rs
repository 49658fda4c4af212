use rmcp::schemars;
use serde::{Deserialize, Serialize};
use sonar_mcp_protocol::{AnalysisStatus, Issue};

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeFileRequest {
    /// File to analyze
    #[schemars(description = "Path of an existing file to analyze (absolute, or relative to the server's working directory).")]
    pub path: String,

    #[schemars(description = "Quality profile key to analyze with (defaults to the engine's default profile for the language).")]
    pub profile: Option<String>,

    #[schemars(description = "Language key hint, e.g. 'js', 'ts', 'java', 'py'. Detected from the file extension when omitted.")]
    pub language: Option<String>,

    #[schemars(description = "Deadline for the whole call in milliseconds (clamped to 100..600000).")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeSnippetRequest {
    #[schemars(description = "Source code to analyze (at most 1 MiB).")]
    pub content: String,

    #[schemars(description = "Language key of the snippet, e.g. 'js', 'ts', 'java', 'py'. Required unless `file_name` has a recognizable extension.")]
    pub language: Option<String>,

    /// Virtual file name reported in issues
    #[schemars(description = "Virtual file name used for the snippet (its extension helps language detection).")]
    pub file_name: Option<String>,

    #[schemars(description = "Quality profile key to analyze with.")]
    pub profile: Option<String>,

    #[schemars(description = "Deadline for the whole call in milliseconds (clamped to 100..600000).")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutput {
    /// File path, or the virtual file name of a snippet
    pub target: String,
    pub status: AnalysisStatus,
    pub issue_count: usize,
    /// Sorted by file, then position, then rule key
    pub issues: Vec<Issue>,
    /// Result was shared with an identical request already in flight
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deduplicated: bool,
    pub elapsed_ms: u64,
}
