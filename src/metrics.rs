//! # Consume Metrics
//!
//! One observation per handled message: delivery latency, the delivery count,
//! and how processing ended. Sinks run on a detached task so a slow or failing
//! sink never holds up a worker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a delivery did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The handler returned an error.
    Error,
    /// The handler exceeded the per-message deadline.
    Timeout,
    /// The handler panicked.
    Panic,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Error => "handler_error",
            FailureKind::Timeout => "handler_timeout",
            FailureKind::Panic => "handler_panic",
        };
        f.write_str(s)
    }
}

/// A failed delivery, normalized from error, timeout or panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl ProcessingFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for ProcessingFailure {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Success,
    Failed(ProcessingFailure),
}

impl ConsumeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConsumeOutcome::Success)
    }
}

impl From<Result<(), ProcessingFailure>> for ConsumeOutcome {
    fn from(result: Result<(), ProcessingFailure>) -> Self {
        match result {
            Ok(()) => ConsumeOutcome::Success,
            Err(failure) => ConsumeOutcome::Failed(failure),
        }
    }
}

pub trait MetricsSink: Send + Sync + 'static {
    fn consume(&self, latency: Duration, deliver_cnt: u64, outcome: &ConsumeOutcome);
}

/// Sink that discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn consume(&self, _latency: Duration, _deliver_cnt: u64, _outcome: &ConsumeOutcome) {}
}

/// Report to `sink` without awaiting it.
pub(crate) fn dispatch(
    sink: &Arc<dyn MetricsSink>,
    latency: Duration,
    deliver_cnt: u64,
    outcome: ConsumeOutcome,
) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        sink.consume(latency, deliver_cnt, &outcome);
    });
}
