//! Shared helpers for queue integration tests.

#![allow(dead_code)]

use dq_core::{InMemoryQueueStore, Queue, QueueConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Config with short intervals so tests finish quickly.
pub fn fast_config(name: &str) -> QueueConfig {
    QueueConfig::new(name)
        .with_poll_interval(Duration::from_millis(10))
        .with_daemon_interval(Duration::from_millis(5))
        .with_retry_interval(Duration::from_millis(10))
        .with_consume_timeout(Duration::from_secs(5))
}

pub fn in_memory_queue(config: QueueConfig) -> Queue<InMemoryQueueStore> {
    dq_core::logging::init_structured_logging();
    Queue::new(Arc::new(InMemoryQueueStore::new()), config).expect("valid config")
}

/// Poll `check` every 5ms until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(within, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Delivery counts observed per message id, in arrival order.
#[derive(Clone, Default)]
pub struct Deliveries(Arc<Mutex<HashMap<String, Vec<u64>>>>);

impl Deliveries {
    pub fn record(&self, id: &str, deliver_cnt: u64) {
        self.0.lock().entry(id.to_string()).or_default().push(deliver_cnt);
    }

    pub fn of(&self, id: &str) -> Vec<u64> {
        self.0.lock().get(id).cloned().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.0.lock().values().map(Vec::len).sum()
    }
}
