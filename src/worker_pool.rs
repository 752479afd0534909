//! Worker pool supervision.
//!
//! Launches the delivery daemon and `worker_count` consume workers under one
//! cancellation token, and a supervisor that joins all of them and then
//! publishes completion exactly once.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::daemon::DeliveryDaemon;
use crate::store::QueueStore;
use crate::worker::{ConsumeContext, Worker};

/// Spawn the daemon, the workers and their supervisor. The returned receiver
/// flips to `true` once every task has exited.
pub(crate) fn spawn<S: QueueStore>(
    ctx: Arc<ConsumeContext<S>>,
    cancel: CancellationToken,
) -> watch::Receiver<bool> {
    let (done_tx, done_rx) = watch::channel(false);
    let queue = ctx.config.name.clone();
    let worker_count = ctx.config.worker_count;

    info!(queue = %queue, worker_count, "spawning consume workers");

    let daemon = DeliveryDaemon::new(
        queue.clone(),
        Arc::clone(&ctx.store),
        ctx.keys.clone(),
        ctx.config.daemon_interval,
        ctx.config.promote_batch_size,
        cancel.clone(),
    );
    let mut handles = Vec::with_capacity(worker_count + 1);
    handles.push(tokio::spawn(daemon.run()));

    for worker_id in 0..worker_count {
        let worker = Worker::new(worker_id, Arc::clone(&ctx), cancel.clone());
        handles.push(tokio::spawn(worker.run()));
    }

    tokio::spawn(async move {
        for (task, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!(queue = %queue, task, error = %e, "consume task terminated abnormally");
            }
        }
        info!(queue = %queue, "all consume tasks stopped");
        done_tx.send_replace(true);
    });

    done_rx
}
