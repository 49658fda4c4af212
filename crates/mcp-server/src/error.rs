use serde_json::json;
use sonar_mcp_protocol::backend::{error_codes as rpc_codes, RpcErrorObject};
use sonar_mcp_protocol::{error_codes, ErrorEnvelope};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Suggested client backoff when the backend is degraded or restarting.
pub const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

/// Per-request failure taxonomy.
///
/// Every variant is isolated to the request that produced it; none of them tears down the
/// server. `Clone` lets a single in-flight analysis hand the same outcome to every caller
/// attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("invalid arguments: {0}")]
    Validation(String),

    #[error("analysis backend unavailable: {reason}")]
    BackendUnavailable { reason: String, retry_after_ms: u64 },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("{message}")]
    BackendFailure { code: i64, message: String },

    #[error("backend process exited unexpectedly: {reason}")]
    ProcessCrash { reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("backend protocol violation: {0}")]
    Protocol(String),
}

impl BridgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
            retry_after_ms: DEFAULT_RETRY_AFTER_MS,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => error_codes::VALIDATION,
            Self::BackendUnavailable { .. } => error_codes::BACKEND_UNAVAILABLE,
            Self::Timeout { .. } => error_codes::TIMEOUT,
            Self::BackendFailure { .. } => error_codes::BACKEND_FAILURE,
            Self::ProcessCrash { .. } => error_codes::PROCESS_CRASH,
            Self::Cancelled => error_codes::CANCELLED,
            Self::Protocol(_) => error_codes::PROTOCOL,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::ProcessCrash { .. }
        )
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        let envelope = ErrorEnvelope::new(self.code(), self.to_string());
        match self {
            Self::Validation(_) => envelope
                .with_hint("Fix the tool arguments; nothing was sent to the analysis backend."),
            Self::BackendUnavailable { retry_after_ms, .. } => envelope
                .retry_after(*retry_after_ms)
                .with_hint("The analysis backend is starting or restarting; retry the tool call with backoff."),
            Self::ProcessCrash { .. } => envelope
                .retry_after(DEFAULT_RETRY_AFTER_MS)
                .with_hint("The analysis backend is being restarted; retry the tool call."),
            Self::Timeout {
                operation,
                after_ms,
            } => envelope
                .with_details(json!({ "operation": operation, "after_ms": after_ms }))
                .with_hint("The request was cancelled; raise `timeout_ms` or retry later."),
            Self::BackendFailure { code, .. } => {
                envelope.with_details(json!({ "backend_code": code }))
            }
            Self::Cancelled | Self::Protocol(_) => envelope,
        }
    }
}

impl From<RpcErrorObject> for BridgeError {
    fn from(error: RpcErrorObject) -> Self {
        if error.code == rpc_codes::REQUEST_CANCELLED {
            return Self::Cancelled;
        }
        Self::BackendFailure {
            code: error.code,
            message: error.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_failure_message_is_verbatim() {
        let err = BridgeError::from(RpcErrorObject::new(
            rpc_codes::UNKNOWN_PROFILE,
            "Profile 'nope' not found",
        ));
        assert_eq!(err.to_string(), "Profile 'nope' not found");
        let envelope = err.to_envelope();
        assert_eq!(envelope.code, "backend_failure");
        assert_eq!(envelope.message, "Profile 'nope' not found");
        assert!(!envelope.retryable);
    }

    #[test]
    fn unavailable_is_retryable_with_backoff_hint() {
        let envelope = BridgeError::unavailable("restarting").to_envelope();
        assert!(envelope.retryable);
        assert_eq!(envelope.retry_after_ms, Some(DEFAULT_RETRY_AFTER_MS));
    }

    #[test]
    fn cancelled_backend_code_maps_to_cancelled() {
        let err = BridgeError::from(RpcErrorObject::new(rpc_codes::REQUEST_CANCELLED, "x"));
        assert_eq!(err, BridgeError::Cancelled);
    }

    #[test]
    fn timeout_reports_operation_and_budget() {
        let err = BridgeError::timeout("analysis/submit", Duration::from_millis(250));
        assert_eq!(err.to_string(), "analysis/submit timed out after 250ms");
        let details = err.to_envelope().details.unwrap();
        assert_eq!(details["after_ms"], 250);
    }
}
