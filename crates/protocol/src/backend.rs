//! Private, versioned wire protocol between the bridge and the analysis engine subprocess.
//!
//! Framing is newline-delimited JSON-RPC 2.0: one compact JSON object per line on the
//! child's stdin (bridge → engine) and stdout (engine → bridge).

use crate::model::{Issue, QualityProfile, RuleDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

pub const BACKEND_PROTOCOL_VERSION: u32 = 1;
pub const JSONRPC_VERSION: &str = "2.0";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "health/ping";
    pub const SUBMIT: &str = "analysis/submit";
    /// Sent as a notification; best-effort.
    pub const CANCEL: &str = "analysis/cancel";
    pub const LIST_RULES: &str = "rules/list";
    pub const GET_PROFILE: &str = "profiles/get";
    pub const BRIDGE_RESTART: &str = "bridge/restart";
    pub const SHUTDOWN: &str = "shutdown";
    /// Notification abandoning a request by its JSON-RPC id.
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";
}

pub mod notifications {
    pub const ISSUES: &str = "analysis/issues";
    pub const COMPLETED: &str = "analysis/completed";
    pub const BRIDGE_STATUS: &str = "bridge/status";
    pub const LOG: &str = "log";
}

pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const ANALYSIS_FAILED: i64 = -32001;
    pub const UNKNOWN_PROFILE: i64 = -32002;
    pub const UNSUPPORTED_LANGUAGE: i64 = -32003;
    pub const BRIDGE_UNAVAILABLE: i64 = -32004;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid JSON-RPC frame: {0}")]
    Invalid(String),
}

/// One line on the backend channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    Request(RpcRequest),
    Notification(RpcNotification),
    Response(RpcResponse),
}

impl RpcFrame {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self::Request(RpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        })
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self::Notification(RpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Some(obj) = value.as_object() else {
            return Err(FrameError::Invalid("expected a JSON object".to_string()));
        };
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        let has_method = obj.get("method").is_some_and(Value::is_string);

        match (has_method, has_id) {
            (true, true) => Ok(Self::Request(serde_json::from_value(value)?)),
            (true, false) => Ok(Self::Notification(serde_json::from_value(value)?)),
            (false, true) => {
                if !obj.contains_key("result") && !obj.contains_key("error") {
                    return Err(FrameError::Invalid(
                        "response carries neither result nor error".to_string(),
                    ));
                }
                Ok(Self::Response(serde_json::from_value(value)?))
            }
            (false, false) => Err(FrameError::Invalid(
                "frame has neither method nor id".to_string(),
            )),
        }
    }

    /// Compact JSON followed by a single `\n`.
    pub fn to_line(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = match self {
            Self::Request(req) => serde_json::to_vec(req)?,
            Self::Notification(note) => serde_json::to_vec(note)?,
            Self::Response(resp) => serde_json::to_vec(resp)?,
        };
        out.push(b'\n');
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    pub protocol_version: u32,
    pub client_name: String,
    pub client_version: String,
    pub plugin_paths: Vec<PathBuf>,
    pub bridge_dir: PathBuf,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    pub protocol_version: u32,
    pub engine_version: String,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeHealth {
    Up,
    Unreachable,
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    pub bridge: BridgeHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisTarget {
    File { path: PathBuf },
    Content { content: String, file_name: String },
}

impl AnalysisTarget {
    pub fn display_path(&self) -> String {
        match self {
            Self::File { path } => path.to_string_lossy().to_string(),
            Self::Content { file_name, .. } => file_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitParams {
    pub correlation_id: u64,
    pub target: AnalysisTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub correlation_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequestParams {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuesParams {
    pub correlation_id: u64,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    /// Finished, but some sensors were skipped (e.g. no analyzer for the language).
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedParams {
    pub correlation_id: u64,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRulesParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRulesResult {
    pub rules: Vec<RuleDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProfileParams {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProfileResult {
    pub profile: QualityProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRestartResult {
    pub bridge: BridgeHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatusParams {
    pub bridge: BridgeHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogParams {
    pub level: String,
    pub message: String,
}
