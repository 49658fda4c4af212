//! Semantic argument checks that run after schema deserialization and before any backend call.

use crate::error::{BridgeError, Result};
use std::path::PathBuf;

pub(crate) const MAX_SNIPPET_BYTES: usize = 1024 * 1024;
const MAX_LANGUAGE_LEN: usize = 32;

pub(crate) fn required(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::validation(format!("`{field}` must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// `None` stays `None`; a present value must not be blank.
pub(crate) fn optional(field: &str, value: Option<String>) -> Result<Option<String>> {
    value.map(|v| required(field, &v)).transpose()
}

/// Lowercase identifier, and one of `supported` when the engine advertised any.
pub(crate) fn language(value: Option<String>, supported: &[String]) -> Result<Option<String>> {
    let Some(language) = optional("language", value)? else {
        return Ok(None);
    };
    let well_formed = language.len() <= MAX_LANGUAGE_LEN
        && language
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '+'));
    if !well_formed {
        return Err(BridgeError::validation(format!(
            "`language` must be a lowercase language key such as 'js' (got '{language}')"
        )));
    }
    if !supported.is_empty() && !supported.iter().any(|l| *l == language) {
        return Err(BridgeError::validation(format!(
            "language '{language}' is not supported; available: {}",
            supported.join(", ")
        )));
    }
    Ok(Some(language))
}

/// Resolves `path` to a canonical path naming an existing regular file.
pub(crate) async fn existing_file(path: &str) -> Result<PathBuf> {
    let path = required("path", path)?;
    let canonical = tokio::fs::canonicalize(&path)
        .await
        .map_err(|err| BridgeError::validation(format!("`path` '{path}' cannot be read: {err}")))?;
    let metadata = tokio::fs::metadata(&canonical)
        .await
        .map_err(|err| BridgeError::validation(format!("`path` '{path}' cannot be read: {err}")))?;
    if !metadata.is_file() {
        return Err(BridgeError::validation(format!(
            "`path` '{path}' is not a regular file"
        )));
    }
    Ok(canonical)
}

pub(crate) fn snippet(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(BridgeError::validation("`content` must not be empty"));
    }
    if content.len() > MAX_SNIPPET_BYTES {
        return Err(BridgeError::validation(format!(
            "`content` is {} bytes; the limit is {MAX_SNIPPET_BYTES}",
            content.len()
        )));
    }
    Ok(())
}

/// Virtual file name of a snippet; needs either a name or a language to derive one from.
pub(crate) fn snippet_file_name(file_name: Option<String>, language: Option<&str>) -> Result<String> {
    if let Some(name) = optional("file_name", file_name)? {
        if name.contains('/') || name.contains('\\') {
            return Err(BridgeError::validation(
                "`file_name` must be a bare file name, not a path",
            ));
        }
        return Ok(name);
    }
    let Some(language) = language else {
        return Err(BridgeError::validation(
            "either `language` or `file_name` is required to analyze a snippet",
        ));
    };
    let extension = match language {
        "kotlin" => "kt",
        "ruby" => "rb",
        "python" => "py",
        other => other,
    };
    Ok(format!("snippet.{extension}"))
}

/// `repository:rule`, both halves non-empty and free of whitespace.
pub(crate) fn rule_key(key: &str) -> Result<String> {
    let key = required("key", key)?;
    let valid = match key.split_once(':') {
        Some((repo, rule)) => {
            !repo.is_empty()
                && !rule.is_empty()
                && !rule.contains(':')
                && !key.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(BridgeError::validation(format!(
            "`key` must look like 'repository:rule' (e.g. 'javascript:S1135'), got '{key}'"
        )));
    }
    Ok(key)
}
