use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod backend;
pub mod model;

pub use model::{
    normalize_issues, ActiveRule, AnalysisResult, AnalysisStatus, Issue, QualityProfile,
    RuleDescriptor, RuleType, Severity, TextRange,
};

pub const STATUS_SCHEMA_VERSION: u32 = 1;

/// Stable error codes carried by [`ErrorEnvelope::code`].
pub mod error_codes {
    pub const VALIDATION: &str = "validation";
    pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";
    pub const TIMEOUT: &str = "timeout";
    pub const BACKEND_FAILURE: &str = "backend_failure";
    pub const PROCESS_CRASH: &str = "process_crash";
    pub const CANCELLED: &str = "cancelled";
    pub const PROTOCOL: &str = "protocol";
    pub const NOT_FOUND: &str = "not_found";
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            hint: None,
            retryable: false,
            retry_after_ms: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retryable = true;
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}

pub fn serialize_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(Into::into)
}
