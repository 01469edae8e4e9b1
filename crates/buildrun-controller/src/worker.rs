//! Worker pool draining the controller's queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use buildrun_core::{Error, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::controller::BuildController;

const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A worker that reconciles builds until the queue shuts down.
pub struct Worker {
    id: usize,
    controller: Arc<BuildController>,
}

impl Worker {
    pub fn new(id: usize, controller: Arc<BuildController>) -> Self {
        Self { id, controller }
    }

    /// Run the worker loop.
    pub async fn run(&self) {
        info!(worker_id = self.id, "Starting worker");
        while self.controller.process_next_work_item().await {}
        info!(worker_id = self.id, "Worker stopped");
    }
}

/// Wait for the caches, run `workers` workers until `shutdown` resolves,
/// then shut the queue down and let in-flight items finish.
pub async fn run_workers(
    controller: Arc<BuildController>,
    workers: usize,
    cache_sync_timeout: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    info!("Waiting for caches to sync");
    let synced = tokio::time::timeout(cache_sync_timeout, async {
        while !controller.caches_synced() {
            tokio::time::sleep(CACHE_SYNC_POLL_INTERVAL).await;
        }
    })
    .await;
    if synced.is_err() {
        error!(timeout = ?cache_sync_timeout, "Caches did not sync");
        return Err(Error::Timeout(format!(
            "caches did not sync within {cache_sync_timeout:?}"
        )));
    }

    info!(workers, "Starting build controller");
    let mut pool = JoinSet::new();
    for id in 0..workers {
        let worker = Worker::new(id, controller.clone());
        pool.spawn(async move { worker.run().await });
    }

    shutdown.await;
    info!("Shutting down build controller");
    controller.queue().shut_down();

    while let Some(result) = pool.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Worker task failed");
        }
    }
    Ok(())
}
