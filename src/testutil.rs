//! Shared test helpers — available to all `#[cfg(test)]` modules in the crate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::backend::{ExecuteError, IssuedToken, TokenBackend, TokenVerdict, WorkUnit};
use crate::config::{Config, DispatchConfig, JanitorConfig, QueueConfig, RetryConfig, TimeoutConfig};
use crate::operation::{Operation, OperationKind, OperationStatus, Origin};
use crate::service::AuthQueueService;

/// A `Config` with intervals shrunk so the full dispatch/retry/janitor
/// machinery runs in tens of milliseconds. The janitor limits are left huge
/// so sweeps never interfere unless a test overrides them.
pub fn test_config() -> Config {
    Config {
        dispatch: DispatchConfig {
            idle_backoff_ms: 5,
            result_poll_ms: 5,
            workers: 2,
        },
        janitor: JanitorConfig {
            interval_ms: 3_600_000,
            pending_age_limit_ms: 3_600_000,
            terminal_retention_ms: 3_600_000,
        },
        queue: QueueConfig {
            capacity: 100,
            watermark: 0.95,
        },
        retry: RetryConfig {
            backoff_base_ms: 10,
            backoff_cap_ms: 80,
            max_retries: 3,
        },
        timeouts: TimeoutConfig {
            extend_session_ms: 2_000,
            generic_ms: 2_000,
            logout_ms: 2_000,
            refresh_ms: 2_000,
            validate_ms: 2_000,
        },
    }
}

/// Build a service around the given backend without starting it.
pub fn test_service(backend: Arc<dyn TokenBackend>) -> Arc<AuthQueueService> {
    Arc::new(AuthQueueService::new(test_config(), backend))
}

/// Scripted behavior for [`StubBackend`].
#[derive(Debug, Clone)]
pub enum StubBehavior {
    Delay(Duration),
    Ok,
    Transient,
    TransientThenOk(u32),
    Validation,
}

/// A `TokenBackend` whose every capability runs the scripted behavior and
/// counts invocations.
pub struct StubBackend {
    pub behavior: Mutex<StubBehavior>,
    pub calls: AtomicU32,
}

impl StubBackend {
    pub fn new(behavior: StubBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), ExecuteError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            StubBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            StubBehavior::Ok => Ok(()),
            StubBehavior::Transient => {
                Err(ExecuteError::Transient("token service unavailable".to_string()))
            }
            StubBehavior::TransientThenOk(failures) if call < failures => {
                Err(ExecuteError::Transient("token service unavailable".to_string()))
            }
            StubBehavior::TransientThenOk(_) => Ok(()),
            StubBehavior::Validation => {
                Err(ExecuteError::Validation("malformed token".to_string()))
            }
        }
    }
}

#[async_trait]
impl TokenBackend for StubBackend {
    async fn verify_token(
        &self,
        _token: &str,
        scopes: &[String],
        _origin: Option<&Origin>,
    ) -> Result<TokenVerdict, ExecuteError> {
        self.gate().await?;
        Ok(TokenVerdict {
            claims: json!({ "scopes": scopes }),
            valid: true,
        })
    }

    async fn refresh_token(
        &self,
        principal_id: &str,
        _refresh_token: &str,
    ) -> Result<IssuedToken, ExecuteError> {
        self.gate().await?;
        Ok(IssuedToken {
            expires_at: Utc::now() + chrono::Duration::hours(1),
            token: format!("tok_{principal_id}"),
        })
    }

    async fn extend_session(
        &self,
        principal_id: &str,
        session_id: &str,
    ) -> Result<IssuedToken, ExecuteError> {
        self.gate().await?;
        Ok(IssuedToken {
            expires_at: Utc::now() + chrono::Duration::hours(1),
            token: format!("tok_{principal_id}_{session_id}"),
        })
    }

    async fn logout(&self, _principal_id: &str, _session_id: &str) -> Result<(), ExecuteError> {
        self.gate().await
    }
}

/// A work unit that records each run and returns a canned value.
pub struct CountingWork {
    pub runs: AtomicU32,
}

impl CountingWork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl WorkUnit for CountingWork {
    async fn run(&self) -> Result<Value, ExecuteError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "run": run }))
    }
}

/// A pending `Operation` for queue/model tests.
pub fn make_operation(kind: OperationKind, principal: Option<&str>) -> Operation {
    Operation {
        cancel_reason: None,
        completed_at: None,
        created_at: Utc::now(),
        error: None,
        id: uuid::Uuid::new_v4().to_string(),
        kind,
        max_retries: 3,
        origin: None,
        principal_id: principal.map(str::to_string),
        priority: kind.default_priority(),
        result: None,
        retry_count: 0,
        session_id: None,
        started_at: None,
        status: OperationStatus::Pending,
        timeout_ms: 2_000,
    }
}
