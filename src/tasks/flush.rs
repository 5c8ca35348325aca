//! Index Flush Task
//!
//! Background task that periodically persists the membership index so a
//! restart can reuse it instead of rebuilding from the caches.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheRegistry;

/// Spawns a background task that saves the membership index whenever it has
/// unsaved changes.
///
/// # Arguments
/// * `registry` - Registry owning the index
/// * `flush_interval_secs` - Interval in seconds between runs
///
/// # Returns
/// A JoinHandle for the spawned task, aborted during graceful shutdown.
pub fn spawn_flush_task(registry: Arc<CacheRegistry>, flush_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(flush_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting index flush task with interval of {} seconds",
            flush_interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;

            let registry = Arc::clone(&registry);
            match tokio::task::spawn_blocking(move || registry.persist_index()).await {
                Ok(Ok(true)) => debug!("membership index persisted"),
                Ok(Ok(false)) => debug!("membership index unchanged"),
                Ok(Err(e)) => warn!(error = %e, "membership index flush failed"),
                Err(e) => warn!(error = %e, "membership index flush panicked"),
            }
        }
    })
}
