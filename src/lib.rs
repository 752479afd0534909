#![allow(clippy::doc_markdown)] // Allow technical terms like Redis, Lua in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # DQ Core
//!
//! Delayed and retrying work queue over Redis with at-least-once delivery.
//!
//! ## Overview
//!
//! Producers enqueue messages for immediate or scheduled delivery. Consumers
//! run a pool of workers that take one message at a time, hand it to a
//! [`Handler`], and commit it on success. Every take re-arms the message for a
//! retry `retry_interval` later, so a crashed process, a failing handler or a
//! timed-out one all lead to redelivery without extra bookkeeping.
//!
//! ## Architecture
//!
//! - **Store**: three keys per queue (ready list, pending sorted set, data
//!   hash) mutated only through atomic Lua scripts ([`store`]).
//! - **Delivery daemon**: moves due pending ids back to the ready list.
//! - **Workers**: adaptive polling, optional shared rate limit, middleware,
//!   panic containment and a per-message deadline.
//! - **Lifecycle**: `Idle -> Running -> ShuttingDown -> Stopped`, with `close`
//!   bounded by a caller deadline ([`Queue::close`]).
//!
//! ## Module Organization
//!
//! - [`queue`] - Public queue handle and lifecycle
//! - [`store`] - Store contract, Redis and in-memory backends
//! - [`handler`] - Handler trait, closure adapter, middleware
//! - [`config`] - Queue and Redis configuration
//! - [`error`] - Structured error handling
//! - [`metrics`] - Per-message consume metrics
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dq_core::{handler_fn, ProducerMessage, Queue, QueueConfig, RedisQueueStore, RedisSettings};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RedisQueueStore::connect(&RedisSettings::from_env()).await?);
//! let queue = Queue::new(store, QueueConfig::new("emails").with_worker_count(4))?;
//!
//! queue.produce(ProducerMessage::new("hello")).await?;
//! queue
//!     .produce(ProducerMessage::new("later").deliver_after(Duration::from_secs(60)))
//!     .await?;
//!
//! queue.consume(handler_fn(|msg| async move {
//!     println!("{} delivered {} time(s)", msg.id, msg.deliver_cnt);
//!     Ok(())
//! }))?;
//!
//! queue.close(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                  # Unit and in-memory integration tests
//! cargo test --features test-services         # Also run against REDIS_URL
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod keys;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod store;

mod daemon;
mod worker;
mod worker_pool;

pub use config::{QueueConfig, QueueSettings, RateLimit, RedisSettings, MAX_PROMOTE_BATCH_SIZE};
pub use error::{QueueError, Result};
pub use handler::{compose, handler_fn, middleware, tracing_middleware, Handler, HandlerResult, Middleware};
pub use keys::QueueKeys;
pub use message::{Message, ProducerMessage};
pub use metrics::{ConsumeOutcome, FailureKind, MetricsSink, NoopMetrics, ProcessingFailure};
pub use queue::{LifecycleState, Queue};
pub use store::{InMemoryQueueStore, QueueStats, QueueStore, RedisQueueStore, Take};
