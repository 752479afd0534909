//! # Handlers and Middleware
//!
//! A [`Handler`] processes one message; returning `Err` leaves the message for
//! automatic retry. Handlers run concurrently on every worker, so they must be
//! `Send + Sync` and should tolerate duplicate delivery.
//!
//! A [`Middleware`] turns one handler into another. The chain is folded once
//! when consumption starts: the first registered middleware is the outermost
//! wrapper, running first on the way in and last on the way out.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, Instrument};

use crate::message::Message;

pub type HandlerResult = anyhow::Result<()>;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn process(&self, message: &Message) -> HandlerResult;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn process(&self, message: &Message) -> HandlerResult {
        (**self).process(message).await
    }
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wrap `f` as a handler. The closure receives its own copy of the message.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn process(&self, message: &Message) -> HandlerResult {
        (self.0)(message.clone()).await
    }
}

pub type Middleware = Arc<dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync>;

/// Build a [`Middleware`] from a closure.
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fold `chain` around `base`; `chain[0]` ends up outermost.
pub fn compose(base: Arc<dyn Handler>, chain: &[Middleware]) -> Arc<dyn Handler> {
    chain.iter().rev().fold(base, |inner, mw| mw(inner))
}

/// Middleware that runs each message inside a `message` span and logs how
/// long the handler took.
pub fn tracing_middleware() -> Middleware {
    middleware(|inner| Arc::new(Traced { inner }))
}

struct Traced {
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Traced {
    async fn process(&self, message: &Message) -> HandlerResult {
        let span = tracing::debug_span!(
            "message",
            message_id = %message.id,
            deliver_cnt = message.deliver_cnt
        );
        let started = Instant::now();
        let result = self.inner.process(message).instrument(span).await;
        debug!(
            message_id = %message.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "handler finished"
        );
        result
    }
}
