//! # Queue Store
//!
//! The store contract the delivery protocol is built on: a FIFO list of ready
//! ids, a score-ordered set of pending ids, and a map of id to message row,
//! mutated only through the atomic operations below.
//!
//! ## Operations
//!
//! - **take_one**: pop the head id, bump `deliver_cnt`, stamp `re_deliver_at`,
//!   and re-arm the id in the pending set at `now + retry_interval`, all in one
//!   atomic step. A handler failure therefore needs no action to be retried.
//! - **commit**: drop the pending entry and the row. Idempotent.
//! - **reschedule**: set the pending score of an existing row. No-op once the
//!   row is gone.
//! - **promote_due**: move every pending id whose score has elapsed to the
//!   tail of the ready list.
//!
//! Every operation takes `now` from the caller so both backends agree on time
//! and tests can drive the clock.

pub mod memory;
pub mod redis;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::keys::QueueKeys;
use crate::message::Message;

pub use self::memory::InMemoryQueueStore;
pub use self::redis::RedisQueueStore;

/// Result of one take attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Take {
    /// Nothing ready.
    Empty,
    /// Serialized row of the taken message, already re-armed for retry.
    Taken(Vec<u8>),
    /// The message reached its delivery cap and was removed instead.
    Exhausted { id: String, deliver_cnt: u64 },
}

/// Sizes of the three structures of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: u64,
    pub pending: u64,
    pub stored: u64,
}

/// Atomic operations over one queue's key space.
pub trait QueueStore: Send + Sync + 'static {
    /// Write the row and place the id in the ready list or, when `deliver_at`
    /// is still in the future, in the pending set.
    fn produce(
        &self,
        keys: &QueueKeys,
        message: &Message,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn take_one(
        &self,
        keys: &QueueKeys,
        retry_interval: Duration,
        max_deliveries: u64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Take>> + Send;

    /// Returns whether a row was removed.
    fn commit(&self, keys: &QueueKeys, id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Returns `false` when the row no longer exists.
    fn reschedule(
        &self,
        keys: &QueueKeys,
        id: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Move at most `limit` due ids; returns how many moved.
    fn promote_due(
        &self,
        keys: &QueueKeys,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn stats(&self, keys: &QueueKeys) -> impl Future<Output = Result<QueueStats>> + Send;

    /// Delete all three structures.
    fn purge(&self, keys: &QueueKeys) -> impl Future<Output = Result<()>> + Send;

    fn provider_name(&self) -> &'static str;
}

/// Pending-set score of a timestamp.
pub(crate) fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
