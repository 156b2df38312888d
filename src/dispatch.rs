//! Worker pool: selects pending operations and executes them.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ExecuteError, Payload, TokenBackend};
use crate::config::RetryConfig;
use crate::operation::Operation;
use crate::service::{AuthQueueService, ClaimedOperation};

/// Spawn one worker loop.
pub(crate) fn start_worker(
    service: Arc<AuthQueueService>,
    worker_id: usize,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(worker_id, "Dispatch worker started");
        let idle = Duration::from_millis(service.config().dispatch.idle_backoff_ms);

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match service.claim_next().await {
                Some(claimed) => run_claimed(&service, claimed, &shutdown).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(worker_id, "Dispatch worker stopped");
    })
}

/// Execute one claimed operation and settle its outcome. Execution failures
/// never escape into the worker loop.
async fn run_claimed(
    service: &Arc<AuthQueueService>,
    claimed: ClaimedOperation,
    shutdown: &CancellationToken,
) {
    let ClaimedOperation { op, payload } = claimed;
    let timeout = Duration::from_millis(op.timeout_ms);
    let started = std::time::Instant::now();

    match tokio::time::timeout(timeout, execute(service.backend(), &op, &payload)).await {
        Ok(Ok(result)) => {
            debug!(
                op_id = %op.id,
                kind = op.kind.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Operation completed"
            );
            service.complete_operation(&op.id, result, started.elapsed()).await;
        }
        Ok(Err(error)) => {
            if error.is_retryable() && op.retry_count < op.max_retries {
                let delay = backoff_delay(&service.config().retry, op.retry_count);
                warn!(
                    op_id = %op.id,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure; will retry"
                );
                Arc::clone(service)
                    .schedule_retry(&op.id, delay, shutdown.clone())
                    .await;
            } else {
                warn!(op_id = %op.id, error = %error, retries = op.retry_count, "Operation failed");
                service.fail_operation(&op.id, error.to_string()).await;
            }
        }
        Err(_) => {
            warn!(op_id = %op.id, timeout_ms = op.timeout_ms, "Operation timed out");
            service
                .fail_operation(&op.id, format!("timed out after {} seconds", timeout.as_secs_f64()))
                .await;
        }
    }
}

/// Run the kind-specific body against the external backend.
async fn execute(
    backend: &dyn TokenBackend,
    op: &Operation,
    payload: &Payload,
) -> Result<serde_json::Value, ExecuteError> {
    match payload {
        Payload::ExtendSession => {
            let principal = required_principal(op)?;
            let session = required_session(op)?;
            encode(&backend.extend_session(principal, session).await?)
        }
        Payload::Generic(work) => work.run().await,
        Payload::Logout => {
            let principal = required_principal(op)?;
            let session = required_session(op)?;
            backend.logout(principal, session).await?;
            Ok(serde_json::Value::Null)
        }
        Payload::RefreshToken { refresh_token } => {
            let principal = required_principal(op)?;
            encode(&backend.refresh_token(principal, refresh_token).await?)
        }
        Payload::ValidateToken { scopes, token } => {
            encode(&backend.verify_token(token, scopes, op.origin.as_ref()).await?)
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ExecuteError> {
    serde_json::to_value(value)
        .map_err(|e| ExecuteError::Transient(format!("failed to encode result: {e}")))
}

fn required_principal(op: &Operation) -> Result<&str, ExecuteError> {
    op.principal_id
        .as_deref()
        .ok_or_else(|| ExecuteError::Validation(format!("{} requires a principal id", op.kind.as_str())))
}

fn required_session(op: &Operation) -> Result<&str, ExecuteError> {
    op.session_id
        .as_deref()
        .ok_or_else(|| ExecuteError::Validation(format!("{} requires a session id", op.kind.as_str())))
}

/// Exponential backoff: base doubled per prior attempt, capped.
pub(crate) fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    Duration::from_millis(retry.backoff_base_ms.saturating_mul(factor).min(retry.backoff_cap_ms))
}
