//! # Delivery Daemon
//!
//! Background task that makes retries and scheduled messages visible again: on
//! every tick it moves pending ids whose time has come onto the tail of the
//! ready list. A failed pass is logged and retried on the next tick.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keys::QueueKeys;
use crate::store::QueueStore;

pub(crate) struct DeliveryDaemon<S: QueueStore> {
    queue: String,
    store: Arc<S>,
    keys: QueueKeys,
    interval: Duration,
    batch_size: usize,
    cancel: CancellationToken,
}

impl<S: QueueStore> DeliveryDaemon<S> {
    pub(crate) fn new(
        queue: String,
        store: Arc<S>,
        keys: QueueKeys,
        interval: Duration,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            store,
            keys,
            interval,
            batch_size,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        info!(
            queue = %self.queue,
            interval_ms = self.interval.as_millis() as u64,
            "delivery daemon started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.promote_pass().await,
            }
        }

        info!(queue = %self.queue, "delivery daemon stopped");
    }

    /// Promote until a batch comes back short, or shutdown is requested.
    async fn promote_pass(&self) {
        let mut total = 0usize;
        loop {
            match self
                .store
                .promote_due(&self.keys, Utc::now(), self.batch_size)
                .await
            {
                Ok(moved) => {
                    total += moved;
                    if moved < self.batch_size || self.cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "promotion pass failed");
                    break;
                }
            }
        }
        if total > 0 {
            debug!(queue = %self.queue, promoted = total, "promoted due messages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, ProducerMessage};
    use crate::store::InMemoryQueueStore;

    #[tokio::test]
    async fn promotes_backlog_larger_than_one_batch_in_one_tick() {
        let store = Arc::new(InMemoryQueueStore::new());
        let keys = QueueKeys::new("daemon-backlog");
        let past = Utc::now() - chrono::Duration::seconds(1);
        let created = past - chrono::Duration::seconds(1);
        for _ in 0..7 {
            let msg = Message::from_producer(ProducerMessage::new("x").deliver_at(past), created);
            store.produce(&keys, &msg, created).await.unwrap();
        }
        assert_eq!(store.stats(&keys).await.unwrap().pending, 7);

        let cancel = CancellationToken::new();
        let daemon = DeliveryDaemon::new(
            "daemon-backlog".to_string(),
            store.clone(),
            keys.clone(),
            Duration::from_secs(3600),
            3,
            cancel.clone(),
        );
        daemon.promote_pass().await;

        let stats = store.stats(&keys).await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.ready, 7);
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let store = Arc::new(InMemoryQueueStore::new());
        let cancel = CancellationToken::new();
        let daemon = DeliveryDaemon::new(
            "daemon-stop".to_string(),
            store,
            QueueKeys::new("daemon-stop"),
            Duration::from_millis(5),
            10,
            cancel.clone(),
        );
        let handle = tokio::spawn(daemon.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("daemon did not stop")
            .unwrap();
    }
}
