use rmcp::schemars;
use serde::{Deserialize, Serialize};
use sonar_mcp_protocol::RuleDescriptor;

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListRulesRequest {
    #[schemars(description = "Only rules of this language key, e.g. 'js'.")]
    pub language: Option<String>,

    #[schemars(description = "Only rules active in this quality profile.")]
    pub profile: Option<String>,

    #[schemars(description = "Deadline in milliseconds (clamped to 100..600000).")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ShowRuleRequest {
    #[schemars(description = "Rule key in `repository:rule` form, e.g. 'javascript:S1135'.")]
    pub key: String,

    #[schemars(description = "Deadline in milliseconds (clamped to 100..600000).")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesOutput {
    pub rule_count: usize,
    pub rules: Vec<RuleDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleOutput {
    pub rule: RuleDescriptor,
}
