//! # Queue Errors
//!
//! Every store round trip maps its failure into one [`QueueError`] variant so
//! worker logs can tell a failed take from a failed commit. None of these are
//! fatal to a running worker; they are logged and the loop continues.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Store unreachable or script error while taking a message.
    #[error("take message failed: {0}")]
    TakeFailed(String),

    /// A stored row could not be decoded into a message.
    #[error("decode message failed: {0}")]
    DecodeFailed(String),

    /// Store unreachable while committing; the message may be delivered again.
    #[error("commit message {id} failed: {reason}")]
    CommitFailed { id: String, reason: String },

    #[error("produce message failed: {0}")]
    ProduceFailed(String),

    #[error("reschedule message {id} failed: {reason}")]
    RescheduleFailed { id: String, reason: String },

    #[error("promote due messages failed: {0}")]
    PromoteFailed(String),

    /// Generic store error (connection setup, stats, purge).
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("queue {0} is already consuming")]
    AlreadyConsuming(String),

    /// Close deadline elapsed while workers were still draining.
    #[error("shutdown deadline of {timeout:?} exceeded, workers still draining")]
    ShutdownTimeout { timeout: Duration },
}

impl QueueError {
    /// True when the error only means "close stopped waiting", not a failure.
    pub fn is_shutdown_timeout(&self) -> bool {
        matches!(self, QueueError::ShutdownTimeout { .. })
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(err: config::ConfigError) -> Self {
        QueueError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
