//! Analysis domain model shared by the bridge, the backend protocol and the tool surface.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Blocker,
    Critical,
    Major,
    Minor,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    CodeSmell,
    Bug,
    Vulnerability,
    SecurityHotspot,
}

/// 1-based lines, 0-based offsets within the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct TextRange {
    pub start_line: u32,
    pub start_line_offset: u32,
    pub end_line: u32,
    pub end_line_offset: u32,
}

impl TextRange {
    pub fn line(line: u32) -> Self {
        Self {
            start_line: line,
            start_line_offset: 0,
            end_line: line,
            end_line_offset: 0,
        }
    }

    fn sort_key(range: Option<&TextRange>) -> (u32, u32, u32, u32) {
        // File-level issues (no range) sort ahead of line-level issues.
        range.map_or((0, 0, 0, 0), |r| {
            (
                r.start_line,
                r.start_line_offset,
                r.end_line,
                r.end_line_offset,
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Issue {
    pub rule_key: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_range: Option<TextRange>,
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    fn location_key(&self) -> (&str, &str, Option<TextRange>) {
        (&self.rule_key, &self.file_path, self.text_range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Complete,
    Partial,
    Failed,
}

/// Issues of one analysis request, in file-then-line order with no duplicate
/// `(rule_key, location)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisResult {
    pub status: AnalysisStatus,
    pub issues: Vec<Issue>,
}

impl AnalysisResult {
    pub fn new(status: AnalysisStatus, issues: impl IntoIterator<Item = Issue>) -> Self {
        Self {
            status,
            issues: normalize_issues(issues),
        }
    }

    pub fn complete(issues: impl IntoIterator<Item = Issue>) -> Self {
        Self::new(AnalysisStatus::Complete, issues)
    }

    pub fn is_complete(&self) -> bool {
        self.status == AnalysisStatus::Complete
    }
}

/// Sorts issues by file, then position, then rule key, dropping repeated
/// `(rule_key, file_path, text_range)` entries. The first occurrence wins.
pub fn normalize_issues(issues: impl IntoIterator<Item = Issue>) -> Vec<Issue> {
    let mut seen = HashSet::new();
    let mut out: Vec<Issue> = Vec::new();
    for issue in issues {
        let key = {
            let (rule, file, range) = issue.location_key();
            (rule.to_string(), file.to_string(), range)
        };
        if seen.insert(key) {
            out.push(issue);
        }
    }
    out.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then_with(|| {
                TextRange::sort_key(a.text_range.as_ref())
                    .cmp(&TextRange::sort_key(b.text_range.as_ref()))
            })
            .then_with(|| a.rule_key.cmp(&b.rule_key))
    });
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RuleDescriptor {
    pub key: String,
    pub name: String,
    pub language: String,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ActiveRule {
    pub rule_key: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QualityProfile {
    pub key: String,
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub active_rules: Vec<ActiveRule>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn issue(rule: &str, file: &str, line: Option<u32>) -> Issue {
        Issue {
            rule_key: rule.to_string(),
            file_path: file.to_string(),
            text_range: line.map(TextRange::line),
            severity: Severity::Major,
            message: format!("{rule} at {file}:{line:?}"),
        }
    }

    #[test]
    fn orders_by_file_then_line() {
        let result = AnalysisResult::complete(vec![
            issue("js:S1", "b.js", Some(3)),
            issue("js:S2", "a.js", Some(10)),
            issue("js:S3", "a.js", Some(2)),
            issue("js:S4", "a.js", None),
        ]);
        let order: Vec<(&str, Option<u32>)> = result
            .issues
            .iter()
            .map(|i| (i.file_path.as_str(), i.text_range.map(|r| r.start_line)))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.js", None),
                ("a.js", Some(2)),
                ("a.js", Some(10)),
                ("b.js", Some(3)),
            ]
        );
    }

    #[test]
    fn drops_duplicate_rule_and_location() {
        let mut dup = issue("js:S1", "a.js", Some(1));
        dup.message = "second copy".to_string();
        let result =
            AnalysisResult::complete(vec![issue("js:S1", "a.js", Some(1)), dup.clone(), {
                let mut other_rule = dup;
                other_rule.rule_key = "js:S9".to_string();
                other_rule
            }]);
        assert_eq!(result.issues.len(), 2);
        assert_eq!(result.issues[0].message, "js:S1 at a.js:Some(1)");
        assert_eq!(result.issues[1].rule_key, "js:S9");
    }

    #[test]
    fn severity_and_status_use_upper_case_on_the_wire() {
        let value = serde_json::to_value(AnalysisResult::complete(vec![issue(
            "js:S1",
            "a.js",
            Some(1),
        )]))
        .unwrap();
        assert_eq!(value["status"], "COMPLETE");
        assert_eq!(value["issues"][0]["severity"], "MAJOR");
    }
}
