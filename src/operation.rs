use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::ClientInfo;

/// Queue key for operations that carry no principal
pub const GLOBAL_PRINCIPAL: &str = "global";

/// What kind of authentication work an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ExtendSession,
    GenericRequest,
    Logout,
    RefreshToken,
    ValidateToken,
}

impl OperationKind {
    /// Default dispatch priority; lower numbers are served first.
    ///
    /// Refreshes and caller-supplied requests outrank plain validation so a
    /// stale session never waits behind bulk token checks.
    pub fn default_priority(self) -> u8 {
        match self {
            OperationKind::ExtendSession => 2,
            OperationKind::GenericRequest => 1,
            OperationKind::Logout => 2,
            OperationKind::RefreshToken => 1,
            OperationKind::ValidateToken => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::ExtendSession => "extend_session",
            OperationKind::GenericRequest => "generic_request",
            OperationKind::Logout => "logout",
            OperationKind::RefreshToken => "refresh_token",
            OperationKind::ValidateToken => "validate_token",
        }
    }
}

/// Lifecycle state of an operation.
///
/// Transitions are monotonic: pending -> in_progress -> one of the terminal
/// states. The internal retry path is the only way back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Cancelled,
    Completed,
    Failed,
    InProgress,
    Pending,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Cancelled | OperationStatus::Completed | OperationStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Pending => "pending",
        }
    }
}

/// Why a cancelled operation was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Expired,
    QueueOverflow,
    Requested,
    ResultTimeout,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CancelReason::Expired => "expired",
            CancelReason::QueueOverflow => "queue overflow",
            CancelReason::Requested => "cancelled by caller",
            CancelReason::ResultTimeout => "timeout waiting for result",
            CancelReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Where an operation originated
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Origin {
    /// Classified client metadata (parsed from the raw client string)
    pub client: ClientInfo,
    /// Network address of the caller, if known
    pub ip_address: Option<String>,
}

/// One unit of authentication work and its execution state.
///
/// The record carries only serializable metadata; the kind-specific payload
/// rides alongside it in the service registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Set when status is `Cancelled`
    pub cancel_reason: Option<CancelReason>,
    /// Set exactly when the operation reaches a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Terminal error description, set when status is `Failed`
    pub error: Option<String>,
    /// Generated unique id, stable for the operation's lifetime
    pub id: String,
    pub kind: OperationKind,
    pub max_retries: u32,
    pub origin: Option<Origin>,
    /// Owning principal; `None` routes to the shared global queue
    pub principal_id: Option<String>,
    /// Lower numeric value is served first
    pub priority: u8,
    /// Result payload, set when status is `Completed`
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    /// Execution deadline enforced by the dispatcher
    pub timeout_ms: u64,
}

impl Operation {
    /// Queue key the operation is serialized under.
    pub fn principal_key(&self) -> String {
        match &self.principal_id {
            Some(id) => format!("user_{id}"),
            None => GLOBAL_PRINCIPAL.to_string(),
        }
    }

    pub(crate) fn mark_in_progress(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = OperationStatus::InProgress;
    }

    pub(crate) fn complete(&mut self, result: serde_json::Value) {
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        self.status = OperationStatus::Completed;
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.status = OperationStatus::Failed;
    }

    pub(crate) fn cancel(&mut self, reason: CancelReason) {
        self.cancel_reason = Some(reason);
        self.completed_at = Some(Utc::now());
        self.status = OperationStatus::Cancelled;
    }

    /// Return to `Pending` for another attempt: clears the previous
    /// execution state and counts the retry.
    pub(crate) fn reset_for_retry(&mut self) {
        self.completed_at = None;
        self.error = None;
        self.retry_count += 1;
        self.started_at = None;
        self.status = OperationStatus::Pending;
    }
}
