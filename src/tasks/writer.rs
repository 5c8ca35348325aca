//! Single-Writer Task
//!
//! Every mutation (change events, rebuilds, shard and cache administration)
//! is queued here and executed one at a time on a blocking thread, so cache
//! writes are serialized without the handlers holding locks across awaits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::RebuildReport;
use crate::directory::{ChangeEvent, MemoryDirectory};
use crate::error::{CacheError, Result};
use crate::ingest::{ChangeIngester, IngestReport};

type Reply<T> = oneshot::Sender<Result<T>>;

// == Job ==
/// One unit of work for the writer.
pub enum Job {
    Event {
        event: ChangeEvent,
        reply: Reply<IngestReport>,
    },
    Rebuild {
        cache: String,
        source: MemoryDirectory,
        reply: Reply<RebuildReport>,
    },
    AddShard {
        cache: String,
        shard_class: String,
        reply: Reply<bool>,
    },
    RemoveCache {
        cache: String,
        reply: Reply<()>,
    },
}

// == Writer Handle ==
/// Cloneable sender side of the writer queue.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Job>,
    cancel: Arc<AtomicBool>,
}

impl WriterHandle {
    /// Queues a change event and waits for it to be committed.
    pub async fn submit_event(&self, event: ChangeEvent) -> Result<IngestReport> {
        self.request(|reply| Job::Event { event, reply }).await
    }

    pub async fn rebuild(&self, cache: String, source: MemoryDirectory) -> Result<RebuildReport> {
        self.request(|reply| Job::Rebuild {
            cache,
            source,
            reply,
        })
        .await
    }

    pub async fn add_shard(&self, cache: String, shard_class: String) -> Result<bool> {
        self.request(|reply| Job::AddShard {
            cache,
            shard_class,
            reply,
        })
        .await
    }

    pub async fn remove_cache(&self, cache: String) -> Result<()> {
        self.request(|reply| Job::RemoveCache { cache, reply }).await
    }

    /// Asks a running rebuild to stop at the next entry.
    pub fn cancel_rebuild(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    async fn request<T>(&self, job: impl FnOnce(Reply<T>) -> Job) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(job(reply))
            .await
            .map_err(|_| CacheError::Internal("writer task has stopped".to_string()))?;
        rx.await
            .map_err(|_| CacheError::Internal("writer task dropped the job".to_string()))?
    }
}

// == Spawn ==
/// Starts the writer on the blocking pool.
///
/// # Arguments
/// * `ingester` - Ingester owning the registry all jobs run against
/// * `queue_depth` - Jobs that may wait before senders are held back
///
/// # Returns
/// The handle used to submit jobs, and the task handle. The task ends once
/// every `WriterHandle` has been dropped and the queue is drained.
pub fn spawn_writer(
    ingester: Arc<ChangeIngester>,
    queue_depth: usize,
) -> (WriterHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Job>(queue_depth.max(1));
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);

    let task = tokio::task::spawn_blocking(move || {
        info!(queue_depth, "writer started");
        while let Some(job) = rx.blocking_recv() {
            run(&ingester, &flag, job);
        }
        info!("writer stopped");
    });

    (WriterHandle { tx, cancel }, task)
}

fn run(ingester: &ChangeIngester, cancel: &AtomicBool, job: Job) {
    let registry = ingester.registry();
    let delivered = match job {
        Job::Event { event, reply } => reply.send(ingester.process(&event)).is_ok(),
        Job::Rebuild {
            cache,
            source,
            reply,
        } => {
            cancel.store(false, Ordering::SeqCst);
            info!(cache = %cache, entries = source.len(), "rebuild started");
            let result = registry.rebuild(&cache, &source, cancel);
            if result.is_ok() {
                ingester.record_rebuild();
            }
            reply.send(result).is_ok()
        }
        Job::AddShard {
            cache,
            shard_class,
            reply,
        } => reply.send(registry.add_shard(&cache, &shard_class)).is_ok(),
        Job::RemoveCache { cache, reply } => reply.send(registry.remove_cache(&cache)).is_ok(),
    };

    if !delivered {
        warn!("job finished but the requester is gone");
    } else {
        debug!("job finished");
    }
}
