use rmcp::schemars;
use serde::{Deserialize, Serialize};
use sonar_mcp_protocol::QualityProfile;

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetQualityProfileRequest {
    #[schemars(description = "Quality profile key.")]
    pub key: String,

    #[schemars(description = "Deadline in milliseconds (clamped to 100..600000).")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityProfileOutput {
    pub active_rule_count: usize,
    pub profile: QualityProfile,
}
