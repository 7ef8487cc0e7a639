//! Error types for the log pipeline.
//!
//! Nothing in this module is ever returned to a caller of [`Pipeline::emit`](crate::Pipeline::emit).
//! [`PipelineError`] values describe absorbed failures; they are logged and carried on telemetry
//! events. [`SinkError`] is what a [`BatchSink`](crate::BatchSink) reports, and [`ConfigError`]
//! surfaces at construction and reconfiguration time only.

use std::time::Duration;

use thiserror::Error;

use crate::event::Level;

/// Failures the pipeline absorbs, counts, and reports through health and telemetry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// A configured sampling rate was outside `[0, 1]` or not a number; the level keeps everything.
    #[error("malformed sampling rate {rate} for level {level}; keeping all events at this level")]
    SamplingAnomaly { level: Level, rate: f64 },

    /// Oldest events were discarded to make room under capacity pressure.
    #[error("buffer full; dropped {dropped} oldest event(s)")]
    BufferOverflow { dropped: u64 },

    /// A single send attempt failed and will be retried.
    #[error("delivery of batch {batch_id} failed on attempt {attempt}: {reason}")]
    DeliveryFailure { batch_id: u64, attempt: u32, reason: SinkError },

    /// Retry budget spent; the batch is discarded.
    #[error("delivery of batch {batch_id} exhausted after {attempts} attempt(s); dropped {events} event(s)")]
    DeliveryExhausted { batch_id: u64, attempts: u32, events: usize },

    /// The circuit breaker refused an attempt; the sink was not called.
    #[error("circuit open for {open_for:?}; batch {batch_id} not sent")]
    CircuitOpenRejection { batch_id: u64, open_for: Duration },
}

/// Failure reported by a sink for one send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The sink could not be reached or failed mid-send. Retried.
    #[error("transport error: {0}")]
    Transport(String),
    /// The sink answered and refused the batch (malformed, too large, unauthorized). Sending it
    /// again would get the same answer, so the batch is dropped without further attempts.
    #[error("rejected by sink: {0}")]
    Rejected(String),
    /// Retried.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

impl SinkError {
    /// Whether another attempt with the same batch could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SinkError::Rejected(_))
    }
}

/// Every problem found while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pipeline configuration: {}", issues.join("; "))]
pub struct ConfigError {
    pub issues: Vec<String>,
}

impl ConfigError {
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    pub fn single(issue: impl Into<String>) -> Self {
        Self { issues: vec![issue.into()] }
    }
}

/// Misuse of the pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("no tokio runtime is running")]
    NoRuntime,
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("pipeline has been shut down")]
    ShutDown,
}
