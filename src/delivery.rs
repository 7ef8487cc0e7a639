//! Batch delivery with retry, backoff and circuit breaking.
//!
//! Every attempt first asks the [`CircuitBreaker`]. A refused attempt still counts toward the
//! batch's attempt budget and waits out the same backoff, but never touches the sink and never
//! changes the breaker. Once the budget is spent the batch is dropped and counted; there is no
//! retry queue beyond the batch currently being delivered. A [`SinkError::Rejected`] answer ends
//! delivery at once: the sink is reachable, so the breaker records a success, but the batch is
//! dropped as exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backoff::Backoff;
use crate::buffer::DeliveryBatch;
use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::clock::{Clock, MonotonicClock};
use crate::config::RetryConfig;
use crate::error::{ConfigError, PipelineError, SinkError};
use crate::jitter::Jitter;
use crate::metrics::{incr, PipelineMetrics};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{CircuitEvent, DeliveryEvent, PipelineEvent, Telemetry};
use crate::window::SlidingWindow;

/// Destination for delivered batches.
///
/// Events arrive in enqueue order. A batch may be offered again after a failed attempt, so sinks
/// that cannot tolerate duplicates should key on [`DeliveryBatch::sequence`].
#[async_trait]
pub trait BatchSink: Send + Sync + std::fmt::Debug {
    async fn send(&self, batch: &DeliveryBatch) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: BatchSink + ?Sized> BatchSink for Arc<T> {
    async fn send(&self, batch: &DeliveryBatch) -> Result<(), SinkError> {
        (**self).send(batch).await
    }
}

/// Terminal result of delivering one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Attempts used up; the events were dropped.
    Exhausted { attempts: u32, events: usize },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

const ATTEMPTS: usize = 0;
const FAILURES: usize = 1;

/// Trailing-window attempt and failure counts (sink calls only; breaker rejections excluded).
#[derive(Debug)]
pub struct DeliveryStats {
    window: SlidingWindow<2>,
    clock: Arc<dyn Clock>,
}

impl DeliveryStats {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { window: SlidingWindow::new(window, 12), clock }
    }

    pub fn record(&self, failed: bool) {
        let now = self.clock.now_millis();
        self.window.record(now, ATTEMPTS, 1);
        if failed {
            self.window.record(now, FAILURES, 1);
        }
    }

    pub fn attempts(&self) -> u64 {
        self.window.total(self.clock.now_millis(), ATTEMPTS)
    }

    pub fn failures(&self) -> u64 {
        self.window.total(self.clock.now_millis(), FAILURES)
    }

    /// Failures / attempts over the trailing window; `0.0` with no attempts.
    pub fn error_rate(&self) -> f64 {
        let now = self.clock.now_millis();
        let attempts = self.window.total(now, ATTEMPTS);
        if attempts == 0 {
            return 0.0;
        }
        let failures = self.window.total(now, FAILURES);
        (failures as f64 / attempts as f64).min(1.0)
    }
}

enum Attempt {
    Sent,
    Failed,
    /// The sink refused the batch for good.
    Refused,
    Rejected,
}

/// Sends batches to a [`BatchSink`] under retry and circuit-breaker policy.
#[derive(Debug)]
pub struct DeliveryManager {
    sink: Arc<dyn BatchSink>,
    breaker: CircuitBreaker,
    backoff: Backoff,
    jitter: Jitter,
    max_attempts: u32,
    attempt_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    stats: Arc<DeliveryStats>,
    metrics: Arc<PipelineMetrics>,
    telemetry: Telemetry,
}

impl DeliveryManager {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        retry: &RetryConfig,
        breaker: CircuitBreaker,
    ) -> Result<Self, ConfigError> {
        let backoff = retry.backoff().map_err(|e| ConfigError::single(format!("retry backoff: {}", e)))?;
        let jitter = retry.jitter().map_err(|e| ConfigError::single(format!("retry jitter: {}", e)))?;
        if retry.max_attempts == 0 {
            return Err(ConfigError::single("retry.max_attempts must be > 0"));
        }
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Ok(Self {
            sink,
            breaker,
            backoff,
            jitter,
            max_attempts: retry.max_attempts,
            attempt_timeout: retry.attempt_timeout,
            sleeper: Arc::new(TokioSleeper),
            stats: Arc::new(DeliveryStats::new(Duration::from_secs(60), clock.clone())),
            clock,
            metrics: Arc::new(PipelineMetrics::new()),
            telemetry: Telemetry::default(),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stats(mut self, stats: Arc<DeliveryStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.stats
    }

    /// Delay slept after `attempt` attempts have failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt as usize))
    }

    /// Deliver `batch`, retrying until success or until `max_attempts` attempts are used.
    pub async fn send_batch(&self, mut batch: DeliveryBatch) -> DeliveryOutcome {
        if batch.is_empty() {
            return DeliveryOutcome::Delivered { attempts: 0 };
        }
        loop {
            match self.attempt(&mut batch, self.attempt_timeout).await {
                Attempt::Sent => return DeliveryOutcome::Delivered { attempts: batch.attempt },
                Attempt::Refused => return self.exhaust(&batch).await,
                Attempt::Failed | Attempt::Rejected => {}
            }
            if batch.attempt >= self.max_attempts {
                return self.exhaust(&batch).await;
            }
            let delay = self.retry_delay(batch.attempt);
            batch.next_retry_at = Some(self.clock.now_millis().saturating_add(millis(delay)));
            tracing::debug!(batch_id = batch.sequence, attempt = batch.attempt, ?delay, "retrying batch");
            self.telemetry
                .emit(PipelineEvent::Delivery(DeliveryEvent::RetryScheduled {
                    batch_id: batch.sequence,
                    attempt: batch.attempt,
                    delay,
                }))
                .await;
            self.sleeper.sleep(delay).await;
        }
    }

    /// One bounded attempt with no retry; a failure drops the batch.
    pub async fn deliver_once(&self, mut batch: DeliveryBatch, timeout: Duration) -> DeliveryOutcome {
        if batch.is_empty() {
            return DeliveryOutcome::Delivered { attempts: 0 };
        }
        match self.attempt(&mut batch, timeout).await {
            Attempt::Sent => DeliveryOutcome::Delivered { attempts: batch.attempt },
            Attempt::Failed | Attempt::Refused | Attempt::Rejected => self.exhaust(&batch).await,
        }
    }

    async fn attempt(&self, batch: &mut DeliveryBatch, timeout: Duration) -> Attempt {
        batch.attempt += 1;
        let batch_id = batch.sequence;

        match self.breaker.check() {
            Admission::Rejected { open_for } => {
                incr(&self.metrics.circuit_rejections, 1);
                tracing::debug!("{}", PipelineError::CircuitOpenRejection { batch_id, open_for });
                self.telemetry
                    .emit(PipelineEvent::Circuit(CircuitEvent::Rejected { batch_id, open_for }))
                    .await;
                return Attempt::Rejected;
            }
            Admission::Allowed { transition } => {
                if let Some(t) = transition {
                    self.telemetry.emit(PipelineEvent::Circuit(CircuitEvent::from_transition(t))).await;
                }
            }
        }

        incr(&self.metrics.delivery_attempts, 1);
        self.telemetry
            .emit(PipelineEvent::Delivery(DeliveryEvent::Attempt {
                batch_id,
                attempt: batch.attempt,
                events: batch.len(),
            }))
            .await;

        let started = self.clock.now_millis();
        let result = match tokio::time::timeout(timeout, self.sink.send(batch)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                self.stats.record(false);
                let transition = self.breaker.record_success();
                incr(&self.metrics.batches_delivered, 1);
                incr(&self.metrics.delivered, batch.len() as u64);
                if let Some(t) = transition {
                    self.telemetry.emit(PipelineEvent::Circuit(CircuitEvent::from_transition(t))).await;
                }
                let duration = Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                self.telemetry
                    .emit(PipelineEvent::Delivery(DeliveryEvent::Succeeded {
                        batch_id,
                        attempts: batch.attempt,
                        events: batch.len(),
                        duration,
                    }))
                    .await;
                Attempt::Sent
            }
            Err(reason) => {
                self.stats.record(true);
                let retryable = reason.is_retryable();
                let transition = if retryable {
                    self.breaker.record_failure()
                } else {
                    self.breaker.record_success()
                };
                incr(&self.metrics.delivery_failures, 1);
                let message = reason.to_string();
                tracing::debug!(
                    "{}",
                    PipelineError::DeliveryFailure { batch_id, attempt: batch.attempt, reason }
                );
                if let Some(t) = transition {
                    self.telemetry.emit(PipelineEvent::Circuit(CircuitEvent::from_transition(t))).await;
                }
                self.telemetry
                    .emit(PipelineEvent::Delivery(DeliveryEvent::Failed {
                        batch_id,
                        attempt: batch.attempt,
                        reason: message,
                    }))
                    .await;
                if retryable {
                    Attempt::Failed
                } else {
                    Attempt::Refused
                }
            }
        }
    }

    async fn exhaust(&self, batch: &DeliveryBatch) -> DeliveryOutcome {
        let events = batch.len();
        incr(&self.metrics.batches_exhausted, 1);
        incr(&self.metrics.dropped_delivery, events as u64);
        let err = PipelineError::DeliveryExhausted {
            batch_id: batch.sequence,
            attempts: batch.attempt,
            events,
        };
        tracing::warn!(batch_id = batch.sequence, events, attempts = batch.attempt, "{}", err);
        self.telemetry
            .emit(PipelineEvent::Delivery(DeliveryEvent::Exhausted {
                batch_id: batch.sequence,
                attempts: batch.attempt,
                events,
            }))
            .await;
        DeliveryOutcome::Exhausted { attempts: batch.attempt, events }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
