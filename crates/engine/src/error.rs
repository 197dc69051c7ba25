//! Error types for the NoETL execution engine.
//!
//! `AppError` covers failures of the engine itself (store, bus, configuration).
//! `ErrorKind` is the taxonomy attached to step failures; it travels on the
//! wire from workers and drives retry decisions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level errors for the engine.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict error (duplicate playbook version, concurrent append)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid pool or step declarations, fatal at plan time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A step requires resources that can never be granted
    #[error("Capacity deadlock: {0}")]
    CapacityDeadlock(String),

    /// Scheduling is suspended until the projections are rebuilt
    #[error("Coordinator suspended: {0}")]
    Suspended(String),

    /// Another coordinator holds leadership
    #[error("Not the active coordinator: {0}")]
    NotLeader(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Environment configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Parse error (YAML, JSON, etc.)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl AppError {
    /// Errors raised by the store or the bus; the coordinator suspends on these.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Internal(_) | AppError::Suspended(_)
        )
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}

/// Classification of a step failure.
///
/// Workers may send any string; unrecognised kinds are treated as permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    Configuration,
    CredentialNotFound,
    CredentialExpired,
    ScopeMismatch,
    Transient,
    Permanent,
    Timeout,
    CapacityDeadlock,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::CredentialNotFound => "credential_not_found",
            ErrorKind::CredentialExpired => "credential_expired",
            ErrorKind::ScopeMismatch => "scope_mismatch",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CapacityDeadlock => "capacity_deadlock",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Kinds retried when a step declares a retry block without listing kinds.
    pub fn default_retryable() -> Vec<ErrorKind> {
        vec![ErrorKind::Transient, ErrorKind::Timeout]
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for ErrorKind {
    fn from(s: &str) -> Self {
        let normalized: String = s
            .to_lowercase()
            .chars()
            .filter(|c| *c != '_' && *c != '-' && *c != ' ')
            .collect();
        let normalized = normalized.strip_suffix("error").unwrap_or(&normalized);
        match normalized {
            "configuration" | "config" => ErrorKind::Configuration,
            "credentialnotfound" => ErrorKind::CredentialNotFound,
            "credentialexpired" => ErrorKind::CredentialExpired,
            "scopemismatch" => ErrorKind::ScopeMismatch,
            "transient" | "transienttool" => ErrorKind::Transient,
            "timeout" => ErrorKind::Timeout,
            "capacitydeadlock" => ErrorKind::CapacityDeadlock,
            "cancelled" | "canceled" => ErrorKind::Cancelled,
            _ => ErrorKind::Permanent,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        ErrorKind::from(s.as_str())
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Failure descriptor recorded on a step instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("execution 42".to_string());
        assert_eq!(err.to_string(), "Resource not found: execution 42");
    }

    #[test]
    fn test_capacity_deadlock_error() {
        let err = AppError::CapacityDeadlock("step x requests gpu".to_string());
        assert_eq!(err.to_string(), "Capacity deadlock: step x requests gpu");
    }

    #[test]
    fn test_error_kind_parsing() {
        assert_eq!(ErrorKind::from("transient"), ErrorKind::Transient);
        assert_eq!(ErrorKind::from("TransientToolError"), ErrorKind::Transient);
        assert_eq!(ErrorKind::from("credential_not_found"), ErrorKind::CredentialNotFound);
        assert_eq!(ErrorKind::from("ScopeMismatch"), ErrorKind::ScopeMismatch);
        assert_eq!(ErrorKind::from("TimeoutError"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from("something_else"), ErrorKind::Permanent);
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::CredentialExpired).unwrap();
        assert_eq!(json, "\"credential_expired\"");
        let kind: ErrorKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(kind, ErrorKind::Timeout);
    }
}
