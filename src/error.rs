//! Error taxonomy shared by the engine, administration and sync paths.
//!
//! Every variant maps to a stable, machine-readable code via [`Error::code`]
//! so the transport layer can surface it without string matching.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad phone number, batch size, illegal field.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate active suppression or a sync already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Attempt to mutate regulatory data, or a regulatory provider without auth.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("upstream '{provider}' unavailable: {reason}")]
    UpstreamUnavailable { provider: String, reason: String },

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// Store-level I/O failure. Transient from the engine's point of view.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Error::PolicyViolation(msg.into())
    }

    pub fn upstream(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UpstreamUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::PolicyViolation(_) => "policy_violation",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Storage(_) => "storage_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether a sync worker may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable { .. } | Error::Timeout { .. } | Error::Storage(_)
        )
    }

    /// Message safe to hand to external callers. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::validation("x").code(), "validation_error");
        assert_eq!(Error::not_found("entry", "1").code(), "not_found");
        assert_eq!(Error::conflict("dup").code(), "conflict");
        assert_eq!(Error::policy("federal").code(), "policy_violation");
        assert_eq!(Error::upstream("ftc", "503").code(), "upstream_unavailable");
        assert_eq!(Error::Cancelled("check").code(), "cancelled");
    }

    #[test]
    fn test_internal_message_is_opaque() {
        let e = Error::internal("connection pool poisoned at db.rs:42");
        assert_eq!(e.public_message(), "internal error");
        assert!(Error::validation("bad").public_message().contains("bad"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::upstream("p", "reset").is_transient());
        assert!(Error::storage("locked").is_transient());
        assert!(!Error::policy("nope").is_transient());
        assert!(!Error::validation("nope").is_transient());
    }
}
