//! External collaborators invoked at execution time.
//!
//! The queue itself performs no token work: each operation kind delegates to
//! exactly one capability of the [`TokenBackend`], or runs a caller-supplied
//! [`WorkUnit`] for generic requests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::operation::Origin;

/// Failure modes of an operation body.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// Malformed input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),
    /// Downstream outage or other transient condition. Retried with backoff.
    #[error("Transient error: {0}")]
    Transient(String),
}

impl ExecuteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecuteError::Transient(_))
    }
}

/// Verdict for a verified token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenVerdict {
    pub claims: Value,
    pub valid: bool,
}

/// A freshly issued or extended token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub expires_at: DateTime<Utc>,
    pub token: String,
}

/// The external token service the dispatcher delegates to.
#[async_trait]
pub trait TokenBackend: Send + Sync {
    /// Verify a token against the required scopes.
    async fn verify_token(
        &self,
        token: &str,
        scopes: &[String],
        origin: Option<&Origin>,
    ) -> Result<TokenVerdict, ExecuteError>;

    /// Exchange a refresh token for a new session token.
    async fn refresh_token(
        &self,
        principal_id: &str,
        refresh_token: &str,
    ) -> Result<IssuedToken, ExecuteError>;

    /// Push out the expiry of an existing session.
    async fn extend_session(
        &self,
        principal_id: &str,
        session_id: &str,
    ) -> Result<IssuedToken, ExecuteError>;

    /// Invalidate a session.
    async fn logout(&self, principal_id: &str, session_id: &str) -> Result<(), ExecuteError>;
}

/// A caller-supplied unit of work for generic requests.
///
/// Stands in for a captured closure so the operation record itself stays
/// serializable; the returned value becomes the operation result verbatim.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn run(&self) -> Result<Value, ExecuteError>;
}

/// Kind-specific input, held in the registry beside the operation record.
#[derive(Clone)]
pub enum Payload {
    ExtendSession,
    Generic(Arc<dyn WorkUnit>),
    Logout,
    RefreshToken { refresh_token: String },
    ValidateToken { scopes: Vec<String>, token: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(ExecuteError::Transient("downstream unavailable".to_string()).is_retryable());
        assert!(!ExecuteError::Validation("malformed token".to_string()).is_retryable());
    }

    #[test]
    fn test_execute_error_messages() {
        let err = ExecuteError::Validation("malformed token".to_string());
        assert_eq!(err.to_string(), "Validation error: malformed token");

        let err = ExecuteError::Transient("connection refused".to_string());
        assert_eq!(err.to_string(), "Transient error: connection refused");
    }
}
