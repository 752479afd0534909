//! # Consume Worker
//!
//! One worker repeatedly takes a message, runs the composed handler under the
//! per-message deadline, and commits on success. A failed, timed-out or
//! panicking handler leaves the message armed for retry by the take itself, so
//! the failure path does not touch the store.
//!
//! ## Polling
//!
//! After a real message was handled the worker polls again immediately
//! instead of waiting for the next tick, so a backlog drains at store speed
//! while an idle queue costs one take per `poll_interval`.
//!
//! Cancellation is observed only while waiting; a handler that is already
//! running completes (or hits its deadline) first.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::handler::Handler;
use crate::keys::QueueKeys;
use crate::message::Message;
use crate::metrics::{self, FailureKind, MetricsSink, ProcessingFailure};
use crate::rate_limit::RateLimiter;
use crate::store::{QueueStore, Take};

/// Everything the workers of one consume session share.
pub(crate) struct ConsumeContext<S: QueueStore> {
    pub(crate) store: Arc<S>,
    pub(crate) keys: QueueKeys,
    pub(crate) config: QueueConfig,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) limiter: Option<RateLimiter>,
    pub(crate) metrics: Option<Arc<dyn MetricsSink>>,
}

pub(crate) struct Worker<S: QueueStore> {
    id: usize,
    ctx: Arc<ConsumeContext<S>>,
    cancel: CancellationToken,
}

impl<S: QueueStore> Worker<S> {
    pub(crate) fn new(id: usize, ctx: Arc<ConsumeContext<S>>, cancel: CancellationToken) -> Self {
        Self { id, ctx, cancel }
    }

    pub(crate) async fn run(self) {
        let queue = self.ctx.config.name.as_str();
        info!(worker_id = self.id, queue = %queue, "consume worker started");

        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll_now = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !poll_now {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }
            if let Some(limiter) = &self.ctx.limiter {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = limiter.acquire() => {}
                }
            }
            poll_now = self.poll_once().await;
        }

        info!(worker_id = self.id, queue = %queue, "consume worker stopped");
    }

    /// One take and, if something was taken, one dispatch. Returns whether the
    /// next poll should skip the wait.
    async fn poll_once(&self) -> bool {
        let ctx = &*self.ctx;
        let taken = ctx
            .store
            .take_one(
                &ctx.keys,
                ctx.config.retry_interval,
                ctx.config.max_deliveries(),
                Utc::now(),
            )
            .await;

        let raw = match taken {
            Ok(Take::Taken(raw)) => raw,
            Ok(Take::Empty) => return false,
            Ok(Take::Exhausted { id, deliver_cnt }) => {
                warn!(
                    worker_id = self.id,
                    message_id = %id,
                    deliver_cnt,
                    "message exhausted its retries and was dropped"
                );
                return true;
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "take failed");
                return false;
            }
        };

        let message = match Message::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "taken message could not be decoded");
                return false;
            }
        };

        let result = invoke(&ctx.handler, &message, ctx.config.consume_timeout).await;
        // measured once the handler is done, so it covers processing time
        let latency = message.delivery_latency(Utc::now());

        match &result {
            Ok(()) => {
                if let Err(e) = ctx.store.commit(&ctx.keys, &message.id).await {
                    warn!(worker_id = self.id, message_id = %message.id, error = %e, "commit failed");
                }
            }
            Err(failure) => {
                debug!(
                    worker_id = self.id,
                    message_id = %message.id,
                    deliver_cnt = message.deliver_cnt,
                    failure = %failure,
                    "message left for retry"
                );
            }
        }

        if let Some(sink) = &ctx.metrics {
            metrics::dispatch(sink, latency, message.deliver_cnt, result.into());
        }
        true
    }
}

/// Run `handler` on `message` with panics contained and `timeout` enforced.
pub(crate) async fn invoke(
    handler: &Arc<dyn Handler>,
    message: &Message,
    timeout: Duration,
) -> Result<(), ProcessingFailure> {
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        timeout,
        AssertUnwindSafe(handler.process(message)).catch_unwind(),
    )
    .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => {
            warn!(message_id = %message.id, error = %e, elapsed_ms, "handler returned error");
            Err(ProcessingFailure::new(FailureKind::Error, format!("{e:#}")))
        }
        Ok(Err(panic)) => {
            let panic_msg = panic_message(&*panic);
            error!(message_id = %message.id, panic_msg = %panic_msg, elapsed_ms, "handler panicked");
            Err(ProcessingFailure::new(FailureKind::Panic, panic_msg))
        }
        Err(_) => {
            warn!(
                message_id = %message.id,
                timeout_ms = timeout.as_millis() as u64,
                "handler exceeded its deadline"
            );
            Err(ProcessingFailure::new(
                FailureKind::Timeout,
                format!("deadline of {timeout:?} exceeded"),
            ))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::message::ProducerMessage;
    use crate::store::InMemoryQueueStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message() -> Message {
        Message::from_producer(ProducerMessage::new("work"), Utc::now())
    }

    #[tokio::test]
    async fn invoke_reports_handler_error() {
        let handler: Arc<dyn Handler> =
            Arc::new(handler_fn(|_m| async { Err(anyhow::anyhow!("not today")) }));
        let failure = invoke(&handler, &message(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Error);
        assert!(failure.reason.contains("not today"));
    }

    #[tokio::test]
    async fn invoke_contains_panics() {
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_m| async {
            if true {
                panic!("handler blew up");
            }
            Ok(())
        }));
        let failure = invoke(&handler, &message(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panic);
        assert_eq!(failure.reason, "handler blew up");
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_enforces_deadline() {
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_m| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }));
        let failure = invoke(&handler, &message(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[test]
    fn panic_payload_kinds() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }

    fn context(
        store: Arc<InMemoryQueueStore>,
        config: QueueConfig,
        handler: Arc<dyn Handler>,
    ) -> Arc<ConsumeContext<InMemoryQueueStore>> {
        Arc::new(ConsumeContext {
            store,
            keys: QueueKeys::new(&config.name),
            config,
            handler,
            limiter: None,
            metrics: None,
        })
    }

    #[tokio::test]
    async fn backlog_drains_without_waiting_for_ticks() {
        let store = Arc::new(InMemoryQueueStore::new());
        let config = QueueConfig::new("worker-fast-path").with_poll_interval(Duration::from_secs(30));
        let keys = QueueKeys::new(&config.name);
        for i in 0..5 {
            let msg = Message::from_producer(ProducerMessage::new(format!("m{i}")), Utc::now());
            store.produce(&keys, &msg, Utc::now()).await.unwrap();
        }

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(move |_m| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        let cancel = CancellationToken::new();
        let worker = Worker::new(0, context(store.clone(), config, handler), cancel.clone());
        let task = tokio::spawn(worker.run());

        tokio::time::timeout(Duration::from_secs(2), async {
            while handled.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backlog was not drained by the fast path");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(store.stats(&keys).await.unwrap().stored, 0);
    }

    #[tokio::test]
    async fn failed_message_stays_armed() {
        let store = Arc::new(InMemoryQueueStore::new());
        let config = QueueConfig::new("worker-failure").with_retry_interval(Duration::from_secs(60));
        let keys = QueueKeys::new(&config.name);
        let msg = Message::from_producer(ProducerMessage::new("x"), Utc::now());
        store.produce(&keys, &msg, Utc::now()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(move |m: Message| {
            let seen = seen_in.clone();
            async move {
                seen.lock().push(m.deliver_cnt);
                Err(anyhow::anyhow!("try later"))
            }
        }));

        let worker = Worker::new(
            0,
            context(store.clone(), config, handler),
            CancellationToken::new(),
        );
        assert!(worker.poll_once().await);
        assert!(!worker.poll_once().await);

        assert_eq!(*seen.lock(), vec![1]);
        let stats = store.stats(&keys).await.unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.pending, 1);
        assert!(store.pending_score(&keys, &msg.id).is_some());
    }

    #[derive(Default)]
    struct LatencySink(Mutex<Vec<Duration>>);

    impl MetricsSink for LatencySink {
        fn consume(&self, latency: Duration, _deliver_cnt: u64, _outcome: &metrics::ConsumeOutcome) {
            self.0.lock().push(latency);
        }
    }

    #[tokio::test]
    async fn reported_latency_includes_handler_time() {
        let store = Arc::new(InMemoryQueueStore::new());
        let config = QueueConfig::new("worker-latency");
        let keys = QueueKeys::new(&config.name);
        let msg = Message::from_producer(ProducerMessage::new("x"), Utc::now());
        store.produce(&keys, &msg, Utc::now()).await.unwrap();

        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_m| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }));
        let sink = Arc::new(LatencySink::default());
        let ctx = Arc::new(ConsumeContext {
            store,
            keys,
            config,
            handler,
            limiter: None,
            metrics: Some(sink.clone() as Arc<dyn MetricsSink>),
        });

        let worker = Worker::new(0, ctx, CancellationToken::new());
        assert!(worker.poll_once().await);

        for _ in 0..100 {
            if !sink.0.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let seen = sink.0.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0] >= Duration::from_millis(99), "latency {:?}", seen[0]);
    }
}
