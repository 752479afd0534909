//! # Queue
//!
//! [`Queue`] is the public face of one logical queue: produce, consume with a
//! handler, reschedule by id, and close with a deadline.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --consume--> Running --close--> ShuttingDown --all tasks exited--> Stopped
//! ```
//!
//! `close` cancels the daemon and workers, then waits for their completion or
//! the caller's deadline, whichever comes first. A deadline expiry is reported
//! as [`QueueError::ShutdownTimeout`]; the tasks keep winding down and a later
//! `close` can wait again. Running handlers are never aborted by `close`, only
//! by their own per-message deadline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::handler::{compose, Handler, Middleware};
use crate::keys::QueueKeys;
use crate::logging::log_queue_operation;
use crate::message::{Message, ProducerMessage};
use crate::metrics::MetricsSink;
use crate::rate_limit::RateLimiter;
use crate::store::{QueueStats, QueueStore};
use crate::worker::ConsumeContext;
use crate::worker_pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

struct Lifecycle {
    state: LifecycleState,
    cancel: Option<CancellationToken>,
    done: Option<watch::Receiver<bool>>,
}

struct QueueInner<S: QueueStore> {
    store: Arc<S>,
    keys: QueueKeys,
    config: QueueConfig,
    middleware: Mutex<Vec<Middleware>>,
    metrics: Mutex<Option<Arc<dyn MetricsSink>>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to one queue. Clones share the same lifecycle, so a handler can hold
/// a clone to reschedule the message it is processing.
pub struct Queue<S: QueueStore> {
    inner: Arc<QueueInner<S>>,
}

impl<S: QueueStore> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: QueueStore> std::fmt::Debug for Queue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.config.name)
            .field("store", &self.inner.store.provider_name())
            .field("state", &self.state())
            .finish()
    }
}

impl<S: QueueStore> Queue<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let keys = QueueKeys::new(&config.name);
        debug!(
            queue = %config.name,
            store = store.provider_name(),
            "queue created"
        );
        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                keys,
                config,
                middleware: Mutex::new(Vec::new()),
                metrics: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle {
                    state: LifecycleState::Idle,
                    cancel: None,
                    done: None,
                }),
            }),
        })
    }

    /// Report per-message metrics to `sink` once consumption starts.
    pub fn with_metrics(self, sink: Arc<dyn MetricsSink>) -> Self {
        *self.inner.metrics.lock() = Some(sink);
        self
    }

    /// Append a middleware. Only allowed before [`Queue::consume`]; the first
    /// registered middleware is the outermost.
    pub fn use_middleware(&self, middleware: Middleware) -> Result<()> {
        // held across the push so a concurrent consume cannot compose without it
        let lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != LifecycleState::Idle {
            return Err(QueueError::AlreadyConsuming(self.inner.config.name.clone()));
        }
        self.inner.middleware.lock().push(middleware);
        Ok(())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.inner.keys
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.lock().state
    }

    /// Store the message and return its id. Immediate messages are consumable
    /// right away; scheduled ones once the daemon promotes them.
    pub async fn produce(&self, message: ProducerMessage) -> Result<String> {
        let now = Utc::now();
        let message = Message::from_producer(message, now);
        self.inner
            .store
            .produce(&self.inner.keys, &message, now)
            .await?;
        debug!(
            queue = %self.inner.config.name,
            message_id = %message.id,
            deliver_at = ?message.deliver_at,
            "message produced"
        );
        Ok(message.id)
    }

    /// Start the daemon and `worker_count` workers. Returns once they are
    /// spawned; must be called from within a tokio runtime.
    pub fn consume<H: Handler>(&self, handler: H) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != LifecycleState::Idle {
            return Err(QueueError::AlreadyConsuming(self.inner.config.name.clone()));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(QueueError::Configuration(
                "consume must be called within a tokio runtime".into(),
            ));
        }

        let base: Arc<dyn Handler> = Arc::new(handler);
        let handler = compose(base, &self.inner.middleware.lock());
        let config = self.inner.config.clone();
        let ctx = Arc::new(ConsumeContext {
            store: Arc::clone(&self.inner.store),
            keys: self.inner.keys.clone(),
            limiter: config.rate_limit.map(RateLimiter::new),
            metrics: self.inner.metrics.lock().clone(),
            config,
            handler,
        });

        let cancel = CancellationToken::new();
        let done = worker_pool::spawn(ctx, cancel.clone());
        lifecycle.state = LifecycleState::Running;
        lifecycle.cancel = Some(cancel);
        lifecycle.done = Some(done);

        let details = format!("worker_count={}", self.inner.config.worker_count);
        log_queue_operation("consume", &self.inner.config.name, "running", Some(&details));
        Ok(())
    }

    /// Stop consuming and wait up to `deadline` for every task to exit.
    pub async fn close(&self, deadline: Duration) -> Result<()> {
        let mut done = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match lifecycle.state {
                LifecycleState::Idle => {
                    lifecycle.state = LifecycleState::Stopped;
                    return Ok(());
                }
                LifecycleState::Stopped => return Ok(()),
                LifecycleState::Running => {
                    lifecycle.state = LifecycleState::ShuttingDown;
                    if let Some(cancel) = &lifecycle.cancel {
                        cancel.cancel();
                    }
                    info!(queue = %self.inner.config.name, "shutdown requested");
                }
                LifecycleState::ShuttingDown => {}
            }
            match &lifecycle.done {
                Some(done) => done.clone(),
                None => {
                    lifecycle.state = LifecycleState::Stopped;
                    return Ok(());
                }
            }
        };

        // a closed channel means the supervisor is gone, which only happens
        // after it published completion or the runtime is shutting down
        let finished = tokio::time::timeout(deadline, done.wait_for(|d| *d))
            .await
            .is_ok();

        if finished {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.state = LifecycleState::Stopped;
            lifecycle.cancel = None;
            lifecycle.done = None;
            log_queue_operation("close", &self.inner.config.name, "stopped", None);
            Ok(())
        } else {
            warn!(
                queue = %self.inner.config.name,
                deadline_ms = deadline.as_millis() as u64,
                "shutdown deadline exceeded, workers still draining"
            );
            Err(QueueError::ShutdownTimeout { timeout: deadline })
        }
    }

    /// Make message `id` due again `delay` from now. Returns `false` when the
    /// message no longer exists.
    pub async fn redelivery_after(&self, id: &str, delay: Duration) -> Result<bool> {
        let delay = chrono::Duration::from_std(delay).map_err(|e| {
            QueueError::RescheduleFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })?;
        let at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| QueueError::RescheduleFailed {
                id: id.to_string(),
                reason: format!("redelivery time out of range: now + {delay}"),
            })?;
        self.redelivery_at(id, at).await
    }

    /// Make message `id` due at `at`. Returns `false` when the message no
    /// longer exists.
    pub async fn redelivery_at(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let updated = self.inner.store.reschedule(&self.inner.keys, id, at).await?;
        debug!(
            queue = %self.inner.config.name,
            message_id = %id,
            redeliver_at = %at,
            updated,
            "redelivery scheduled"
        );
        Ok(updated)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.inner.store.stats(&self.inner.keys).await
    }

    /// Delete every message of this queue.
    pub async fn purge(&self) -> Result<()> {
        self.inner.store.purge(&self.inner.keys).await
    }
}
