//! The queue service: enqueue surface, result retrieval, and lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Payload, TokenBackend, WorkUnit};
use crate::config::Config;
use crate::device::classify_client;
use crate::dispatch;
use crate::janitor;
use crate::operation::{CancelReason, Operation, OperationKind, OperationStatus, Origin};
use crate::queue::{PrincipalQueue, SlotKey};
use crate::stats::{Counters, QueueStats};

/// Errors surfaced by the enqueue and result-retrieval surface.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: CancelReason },
    #[error("Operation failed: {0}")]
    Failed(String),
    #[error("Operation not found: {0}")]
    OperationNotFound(String),
    #[error("Queue service is not running")]
    ServiceNotRunning,
    #[error("Timed out waiting for operation {0}")]
    WaitTimeout(String),
}

/// Post-completion callback, invoked after the dispatcher settles an
/// operation. Failures are logged and never change the recorded outcome.
pub type CompletionHook = Arc<
    dyn Fn(&Operation) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
>;

/// Common optional fields accepted by every enqueue call.
#[derive(Default)]
pub struct EnqueueOptions {
    /// Raw client string (typically a User-Agent), classified on enqueue
    pub client: Option<String>,
    pub ip_address: Option<String>,
    pub max_retries: Option<u32>,
    pub on_complete: Option<CompletionHook>,
    pub principal_id: Option<String>,
    pub priority: Option<u8>,
    pub session_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl EnqueueOptions {
    /// Options for an operation owned by the given principal.
    pub fn principal(id: impl Into<String>) -> Self {
        Self {
            principal_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_origin(mut self, ip_address: impl Into<String>, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_hook(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }
}

/// A registered operation: the serializable record plus the pieces that ride
/// alongside it.
pub(crate) struct Registered {
    pub hook: Option<CompletionHook>,
    pub op: Operation,
    pub payload: Payload,
    /// Queue slot currently holding this operation, if any
    pub slot: Option<SlotKey>,
}

/// An operation handed to a worker for execution.
pub(crate) struct ClaimedOperation {
    pub op: Operation,
    pub payload: Payload,
}

/// In-process queue service serializing authentication operations per
/// principal.
///
/// Owned by whatever bootstraps the application and passed by `Arc`;
/// explicitly started and stopped.
pub struct AuthQueueService {
    backend: Arc<dyn TokenBackend>,
    config: Config,
    counters: Counters,
    handles: Mutex<Vec<JoinHandle<()>>>,
    operations: RwLock<HashMap<String, Registered>>,
    queues: RwLock<HashMap<String, Arc<Mutex<PrincipalQueue>>>>,
    running: AtomicBool,
    seq: AtomicU64,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl AuthQueueService {
    pub fn new(config: Config, backend: Arc<dyn TokenBackend>) -> Self {
        Self {
            backend,
            config,
            counters: Counters::default(),
            handles: Mutex::new(Vec::new()),
            operations: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            shutdown: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn backend(&self) -> &dyn TokenBackend {
        self.backend.as_ref()
    }

    /// Spawn the worker pool and the janitor. Idempotent.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock().await = Some(token.clone());

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.config.dispatch.workers {
            handles.push(dispatch::start_worker(
                Arc::clone(&self),
                worker_id,
                token.clone(),
            ));
        }
        handles.push(janitor::start_janitor(Arc::clone(&self), token.clone()));

        info!(workers = self.config.dispatch.workers, "Auth queue service started");
    }

    /// Stop the worker pool, then settle anything still pending.
    ///
    /// In-flight operations run to completion (there is no hard-kill of
    /// executing work); pending ones are cancelled with reason `shutdown`.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(token) = self.shutdown.lock().await.take() {
            token.cancel();
        }

        let drained: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in drained {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally during shutdown");
            }
        }

        let mut cancelled = 0usize;
        {
            let mut ops = self.operations.write().await;
            for reg in ops.values_mut() {
                if reg.op.status == OperationStatus::Pending {
                    reg.op.cancel(CancelReason::Shutdown);
                    reg.slot = None;
                    cancelled += 1;
                }
            }
        }
        self.queues.write().await.clear();

        info!(cancelled_pending = cancelled, "Auth queue service stopped");
    }

    /// Queue a token-validation operation. Returns the operation id.
    pub async fn enqueue_token_validation(
        &self,
        token: impl Into<String>,
        scopes: Vec<String>,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.enqueue(
            OperationKind::ValidateToken,
            Payload::ValidateToken {
                scopes,
                token: token.into(),
            },
            opts,
        )
        .await
    }

    /// Queue a refresh-token exchange. Returns the operation id.
    pub async fn enqueue_token_refresh(
        &self,
        refresh_token: impl Into<String>,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.enqueue(
            OperationKind::RefreshToken,
            Payload::RefreshToken {
                refresh_token: refresh_token.into(),
            },
            opts,
        )
        .await
    }

    /// Queue a session-extension operation. Returns the operation id.
    pub async fn enqueue_session_extension(
        &self,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.enqueue(OperationKind::ExtendSession, Payload::ExtendSession, opts)
            .await
    }

    /// Queue a logout. Returns the operation id.
    pub async fn enqueue_logout(&self, opts: EnqueueOptions) -> Result<String, QueueError> {
        self.enqueue(OperationKind::Logout, Payload::Logout, opts).await
    }

    /// Queue a caller-supplied unit of work. Its return value becomes the
    /// operation result verbatim; never polling afterwards is legitimate.
    pub async fn enqueue_generic_request(
        &self,
        work: Arc<dyn WorkUnit>,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.enqueue(OperationKind::GenericRequest, Payload::Generic(work), opts)
            .await
    }

    async fn enqueue(
        &self,
        kind: OperationKind,
        payload: Payload,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        if !self.is_running() {
            return Err(QueueError::ServiceNotRunning);
        }

        let origin = match (opts.ip_address, opts.client) {
            (None, None) => None,
            (ip_address, client) => Some(Origin {
                client: classify_client(client.as_deref().unwrap_or_default()),
                ip_address,
            }),
        };

        let op = Operation {
            cancel_reason: None,
            completed_at: None,
            created_at: chrono::Utc::now(),
            error: None,
            id: Uuid::new_v4().to_string(),
            kind,
            max_retries: opts.max_retries.unwrap_or(self.config.retry.max_retries),
            origin,
            principal_id: opts.principal_id,
            priority: opts.priority.unwrap_or_else(|| kind.default_priority()),
            result: None,
            retry_count: 0,
            session_id: opts.session_id,
            started_at: None,
            status: OperationStatus::Pending,
            timeout_ms: opts.timeout_ms.unwrap_or_else(|| self.config.timeouts.for_kind(kind)),
        };

        let key = op.principal_key();
        let op_id = op.id.clone();
        let priority = op.priority;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        // Register first so callers can poll the id as soon as it returns.
        {
            let mut ops = self.operations.write().await;
            ops.insert(
                op_id.clone(),
                Registered {
                    hook: opts.on_complete,
                    op,
                    payload,
                    slot: Some((priority, seq)),
                },
            );
        }

        let queue = self.queue_for(&key).await;
        let evicted = {
            let mut q = queue.lock().await;
            if q.len() >= self.config.queue.watermark_len() {
                self.counters.record_overflow_pressure();
                warn!(
                    principal = %key,
                    depth = q.len(),
                    capacity = self.config.queue.capacity,
                    "Principal queue near capacity"
                );
            }
            let evicted = if q.len() >= self.config.queue.capacity {
                q.oldest().and_then(|victim| q.remove(victim))
            } else {
                None
            };
            q.insert(priority, seq, op_id.clone());
            evicted
        };

        if let Some(victim_id) = evicted {
            let mut ops = self.operations.write().await;
            if let Some(reg) = ops.get_mut(&victim_id) {
                if reg.op.status == OperationStatus::Pending {
                    reg.op.cancel(CancelReason::QueueOverflow);
                    reg.slot = None;
                    self.counters.record_overflow_eviction();
                    warn!(
                        op_id = %victim_id,
                        principal = %key,
                        "Evicted oldest pending operation from full queue"
                    );
                }
            }
        }

        debug!(op_id = %op_id, kind = kind.as_str(), principal = %key, priority, "Enqueued operation");
        Ok(op_id)
    }

    /// Poll until the operation settles or `timeout` elapses.
    ///
    /// A caller that times out abandons the operation: it is cancelled so a
    /// worker finishing later does not report to a caller that gave up.
    pub async fn await_result(
        &self,
        op_id: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.dispatch.result_poll_ms);

        loop {
            {
                let ops = self.operations.read().await;
                let reg = ops
                    .get(op_id)
                    .ok_or_else(|| QueueError::OperationNotFound(op_id.to_string()))?;
                match reg.op.status {
                    OperationStatus::Completed => {
                        return Ok(reg.op.result.clone().unwrap_or(serde_json::Value::Null));
                    }
                    OperationStatus::Failed => {
                        return Err(QueueError::Failed(
                            reg.op.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                        ));
                    }
                    OperationStatus::Cancelled => {
                        return Err(QueueError::Cancelled {
                            reason: reg.op.cancel_reason.unwrap_or(CancelReason::Requested),
                        });
                    }
                    OperationStatus::InProgress | OperationStatus::Pending => {}
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.abandon(op_id).await;
                return Err(QueueError::WaitTimeout(op_id.to_string()));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancel an operation whose caller stopped waiting.
    async fn abandon(&self, op_id: &str) {
        let detached = {
            let mut ops = self.operations.write().await;
            match ops.get_mut(op_id) {
                Some(reg) if !reg.op.status.is_terminal() => {
                    reg.op.cancel(CancelReason::ResultTimeout);
                    debug!(op_id, "Caller stopped waiting; operation cancelled");
                    reg.slot.take().map(|slot| (reg.op.principal_key(), slot))
                }
                _ => None,
            }
        };
        if let Some((key, slot)) = detached {
            self.detach_slot(&key, slot).await;
        }
    }

    /// Best-effort cancellation: succeeds only while the operation is still
    /// pending. Returns false for any other status or an unknown id.
    pub async fn cancel_operation(&self, op_id: &str) -> bool {
        let detached = {
            let mut ops = self.operations.write().await;
            match ops.get_mut(op_id) {
                Some(reg) if reg.op.status == OperationStatus::Pending => {
                    reg.op.cancel(CancelReason::Requested);
                    reg.slot.take().map(|slot| (reg.op.principal_key(), slot))
                }
                _ => return false,
            }
        };
        if let Some((key, slot)) = detached {
            self.detach_slot(&key, slot).await;
        }
        debug!(op_id, "Operation cancelled by caller");
        true
    }

    /// Snapshot of a single operation record.
    pub async fn operation(&self, op_id: &str) -> Option<Operation> {
        self.operations.read().await.get(op_id).map(|reg| reg.op.clone())
    }

    /// Read-only diagnostics snapshot.
    pub async fn queue_stats(&self) -> QueueStats {
        let mut queue_depths = BTreeMap::new();
        {
            let queues = self.queues.read().await;
            for (key, queue) in queues.iter() {
                queue_depths.insert(key.clone(), queue.lock().await.len());
            }
        }

        let mut operations_by_status: BTreeMap<String, usize> = BTreeMap::new();
        {
            let ops = self.operations.read().await;
            for reg in ops.values() {
                *operations_by_status
                    .entry(reg.op.status.as_str().to_string())
                    .or_default() += 1;
            }
        }

        let total_queues = queue_depths.len();
        let running = self.is_running();
        QueueStats {
            avg_processing_ms: self.counters.avg_processing_ms(),
            operations_by_status,
            overflow_pressure: self.counters.overflow_pressure(),
            queue_depths,
            running,
            total_cancelled_overflow: self.counters.cancelled_overflow(),
            total_failed: self.counters.failed(),
            total_processed: self.counters.processed(),
            total_queues,
            workers: if running { self.config.dispatch.workers } else { 0 },
        }
    }

    async fn queue_for(&self, key: &str) -> Arc<Mutex<PrincipalQueue>> {
        {
            let queues = self.queues.read().await;
            if let Some(queue) = queues.get(key) {
                return Arc::clone(queue);
            }
        }
        let mut queues = self.queues.write().await;
        Arc::clone(queues.entry(key.to_string()).or_default())
    }

    async fn detach_slot(&self, key: &str, slot: SlotKey) {
        let queue = self.queues.read().await.get(key).map(Arc::clone);
        if let Some(queue) = queue {
            queue.lock().await.remove(slot);
        }
    }

    /// Select, and atomically claim, the globally best pending slot.
    ///
    /// Two-phase: pick the queue whose head has the lowest `(priority, seq)`,
    /// then pop that queue's current head and re-validate it against the
    /// registry. The pop is what makes the claim exclusive - a slot leaves
    /// its queue exactly once, and the pending -> in-progress flip happens
    /// under the registry lock. A slot whose record is no longer pending was
    /// cancelled while queued; it is discarded and the scan restarts.
    pub(crate) async fn claim_next(&self) -> Option<ClaimedOperation> {
        loop {
            let snapshot: Vec<Arc<Mutex<PrincipalQueue>>> = {
                let queues = self.queues.read().await;
                queues.values().map(Arc::clone).collect()
            };

            let mut best: Option<(SlotKey, Arc<Mutex<PrincipalQueue>>)> = None;
            for queue in &snapshot {
                let guard = queue.lock().await;
                if let Some((slot, _)) = guard.peek() {
                    let better = best.as_ref().map_or(true, |(best_slot, _)| slot < *best_slot);
                    if better {
                        best = Some((slot, Arc::clone(queue)));
                    }
                }
            }
            let (_, queue) = best?;

            // Another worker may have raced us between peek and pop; whatever
            // is at the head now is still a valid choice for this queue.
            let Some((_, op_id)) = queue.lock().await.pop_first() else {
                continue;
            };

            let mut ops = self.operations.write().await;
            let Some(reg) = ops.get_mut(&op_id) else {
                continue;
            };
            if reg.op.status != OperationStatus::Pending {
                continue;
            }
            reg.op.mark_in_progress();
            reg.slot = None;
            return Some(ClaimedOperation {
                op: reg.op.clone(),
                payload: reg.payload.clone(),
            });
        }
    }

    /// Record a successful result. No-op if the operation is no longer in
    /// progress - the caller gave up and cancelled it, and must not be told
    /// otherwise.
    pub(crate) async fn complete_operation(
        &self,
        op_id: &str,
        result: serde_json::Value,
        elapsed: Duration,
    ) {
        let hook = {
            let mut ops = self.operations.write().await;
            let Some(reg) = ops.get_mut(op_id) else { return };
            if reg.op.status != OperationStatus::InProgress {
                debug!(op_id, status = reg.op.status.as_str(), "Discarding result for abandoned operation");
                return;
            }
            reg.op.complete(result);
            self.counters.record_success(elapsed);
            reg.hook.as_ref().map(|hook| (Arc::clone(hook), reg.op.clone()))
        };
        self.run_hook(hook);
    }

    /// Record a terminal failure.
    pub(crate) async fn fail_operation(&self, op_id: &str, error: String) {
        let hook = {
            let mut ops = self.operations.write().await;
            let Some(reg) = ops.get_mut(op_id) else { return };
            if reg.op.status != OperationStatus::InProgress {
                debug!(op_id, status = reg.op.status.as_str(), "Discarding failure for abandoned operation");
                return;
            }
            reg.op.fail(error);
            self.counters.record_failure();
            reg.hook.as_ref().map(|hook| (Arc::clone(hook), reg.op.clone()))
        };
        self.run_hook(hook);
    }

    fn run_hook(&self, hook: Option<(CompletionHook, Operation)>) {
        if let Some((hook, op)) = hook {
            if let Err(e) = hook(&op) {
                warn!(op_id = %op.id, error = %e, "Completion callback failed");
            }
        }
    }

    /// Return an operation to pending and re-admit it after `delay`.
    ///
    /// The delay runs in a detached task so a worker is never parked on a
    /// backoff sleep.
    pub(crate) async fn schedule_retry(
        self: Arc<Self>,
        op_id: &str,
        delay: Duration,
        shutdown: CancellationToken,
    ) {
        {
            let mut ops = self.operations.write().await;
            let Some(reg) = ops.get_mut(op_id) else { return };
            if reg.op.status != OperationStatus::InProgress {
                return;
            }
            reg.op.reset_for_retry();
            debug!(
                op_id,
                retry = reg.op.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
        }

        let op_id = op_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => self.requeue(&op_id).await,
                _ = shutdown.cancelled() => {
                    // The shutdown sweep settles the record.
                }
            }
        });
    }

    /// Re-insert a retried operation into its principal queue.
    pub(crate) async fn requeue(&self, op_id: &str) {
        if !self.is_running() {
            return;
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let placed = {
            let mut ops = self.operations.write().await;
            let Some(reg) = ops.get_mut(op_id) else { return };
            if reg.op.status != OperationStatus::Pending || reg.slot.is_some() {
                return;
            }
            let slot: SlotKey = (reg.op.priority, seq);
            reg.slot = Some(slot);
            (reg.op.principal_key(), reg.op.priority, reg.op.id.clone())
        };

        let (key, priority, id) = placed;
        let queue = self.queue_for(&key).await;
        queue.lock().await.insert(priority, seq, id);
    }

    /// One janitor pass: expire stale pending work, drop aged terminal
    /// records, prune empty queues.
    ///
    /// Candidates are snapshotted under short read locks first; each removal
    /// then takes its own constant-time critical section, so the sweep never
    /// blocks enqueue or dispatch for its full duration.
    pub(crate) async fn sweep(&self) {
        let now = chrono::Utc::now();
        let pending_limit =
            chrono::Duration::milliseconds(self.config.janitor.pending_age_limit_ms as i64);
        let retention =
            chrono::Duration::milliseconds(self.config.janitor.terminal_retention_ms as i64);

        let (stale, finished): (Vec<String>, Vec<String>) = {
            let ops = self.operations.read().await;
            let mut stale = Vec::new();
            let mut finished = Vec::new();
            for reg in ops.values() {
                match reg.op.status {
                    OperationStatus::Pending if now - reg.op.created_at > pending_limit => {
                        stale.push(reg.op.id.clone());
                    }
                    status if status.is_terminal() => {
                        if reg.op.completed_at.is_some_and(|done| now - done > retention) {
                            finished.push(reg.op.id.clone());
                        }
                    }
                    _ => {}
                }
            }
            (stale, finished)
        };

        let mut expired = 0usize;
        for op_id in stale {
            let detached = {
                let mut ops = self.operations.write().await;
                let mut detached = None;
                let mut remove = false;
                if let Some(reg) = ops.get_mut(&op_id) {
                    // Re-check: a worker may have claimed it since the snapshot.
                    if reg.op.status == OperationStatus::Pending {
                        reg.op.cancel(CancelReason::Expired);
                        detached = reg.slot.take().map(|slot| (reg.op.principal_key(), slot));
                        remove = true;
                    }
                }
                if remove {
                    ops.remove(&op_id);
                    expired += 1;
                }
                detached
            };
            if let Some((key, slot)) = detached {
                self.detach_slot(&key, slot).await;
            }
        }
        if expired > 0 {
            info!(count = expired, "Expired stale pending operations");
        }

        let mut dropped = 0usize;
        for op_id in finished {
            let mut ops = self.operations.write().await;
            let terminal = ops.get(&op_id).is_some_and(|reg| reg.op.status.is_terminal());
            if terminal {
                ops.remove(&op_id);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(count = dropped, "Dropped settled operation records past retention");
        }

        // Queues observed empty are removed to bound memory growth from
        // transient principals.
        let empty: Vec<String> = {
            let queues = self.queues.read().await;
            let mut empty = Vec::new();
            for (key, queue) in queues.iter() {
                if queue.lock().await.is_empty() {
                    empty.push(key.clone());
                }
            }
            empty
        };
        let mut pruned = 0usize;
        for key in empty {
            let mut queues = self.queues.write().await;
            let still_empty = match queues.get(&key) {
                Some(queue) => queue.lock().await.is_empty(),
                None => false,
            };
            if still_empty {
                queues.remove(&key);
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(count = pruned, "Pruned empty principal queues");
        }
    }
}
