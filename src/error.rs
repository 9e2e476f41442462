//! Typed error taxonomy for the sync engine.
//!
//! Every failure a host can observe from this crate funnels through
//! [`SyncError`]. The variants are the nine kinds from the error handling
//! design: permanent failures the host must surface, retryable failures the
//! engine absorbs internally, and `Conflict`, which the [`crate::reconciler`]
//! resolves before the engine ever shows it to the host.

use std::time::Duration;
use thiserror::Error;

/// Unified error type returned by HTTP calls and surfaced by failed operations.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    /// 400 — request payload failed server-side validation.
    #[error("validation failed{}: {message}", field.as_ref().map(|f| format!(" on field `{f}`")).unwrap_or_default())]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// 401 — authentication failed and token refresh did not recover it.
    #[error("authentication failed (requires_login={requires_login})")]
    Auth { requires_login: bool },

    /// 403 — caller is authenticated but not permitted.
    #[error("permission denied")]
    PermissionDenied,

    /// 404 — resource does not exist.
    #[error("resource not found{}", resource_id.as_ref().map(|id| format!(": {id}")).unwrap_or_default())]
    ResourceNotFound { resource_id: Option<String> },

    /// 409 — server reports a conflict; the reconciler decides what happens next.
    #[error("conflict ({conflict_type})")]
    Conflict {
        conflict_type: String,
        server_version: Option<i64>,
        client_version: Option<i64>,
        body: serde_json::Value,
    },

    /// 429/503 — retry later, optionally honoring a server-supplied delay.
    #[error("retryable error, retry_after={retry_after:?}")]
    Retryable { retry_after: Option<Duration> },

    /// Other 5xx — server-side failure, always retryable.
    #[error("server error (status {status})")]
    Server { status: u16 },

    /// Connection/timeout failure below the HTTP layer.
    #[error("network error: {message}")]
    Network { message: String },

    /// Parse failure, schema mismatch, or other internal inconsistency.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Whether the engine should retry this error with backoff (as opposed
    /// to archiving the operation as permanently failed).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Retryable { .. } | SyncError::Server { .. } | SyncError::Network { .. }
        )
    }

    /// Whether this error should count against the circuit breaker's
    /// failure window. Only network-class failures count; a 4xx client
    /// error reflects the request, not the server's health.
    pub fn is_network_class(&self) -> bool {
        matches!(self, SyncError::Network { .. } | SyncError::Server { .. })
    }

    /// Server-supplied retry delay, if any (429/503 with `Retry-After`).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Retryable { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short, stable diagnostic string suitable for `PendingOp::last_error`.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Retryable { retry_after: None }.is_retryable());
        assert!(SyncError::Server { status: 503 }.is_retryable());
        assert!(SyncError::Network { message: "timeout".into() }.is_retryable());
        assert!(!SyncError::Validation { field: None, message: "x".into() }.is_retryable());
        assert!(!SyncError::PermissionDenied.is_retryable());
    }

    #[test]
    fn network_class_feeds_breaker() {
        assert!(SyncError::Network { message: "x".into() }.is_network_class());
        assert!(SyncError::Server { status: 500 }.is_network_class());
        assert!(!SyncError::Retryable { retry_after: None }.is_network_class());
    }

    #[test]
    fn summary_is_stable_text() {
        let err = SyncError::ResourceNotFound { resource_id: Some("r1".into()) };
        assert!(err.summary().contains("r1"));
    }
}
