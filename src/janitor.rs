//! Background janitor: expires stale operations and prunes idle queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::service::AuthQueueService;

/// Spawn the periodic sweep task.
pub(crate) fn start_janitor(
    service: Arc<AuthQueueService>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval = Duration::from_millis(service.config().janitor.interval_ms);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a freshly started
        // service does not sweep before any work arrives.
        ticker.tick().await;
        debug!(interval_ms = interval.as_millis() as u64, "Janitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => service.sweep().await,
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Janitor stopped");
    })
}
