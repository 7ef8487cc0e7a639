//! The assembled pipeline: enrich, sample, buffer, flush, deliver.
//!
//! ```text
//! emit ─► metadata ─► Sampler ─► LogBuffer ──flush──► queue ─► worker ─► DeliveryManager ─► sink
//!                                    ▲                                        │
//!                          flush timer (interval)                   CircuitBreaker, stats
//! ```
//!
//! Producers only ever touch the sampler, the buffer and a non-blocking `try_send`. A single
//! worker task owns delivery, so batches reach the sink in flush order. Each pipeline owns all of
//! its state; several can run side by side in one process.
//!
//! ```no_run
//! use logrelay::{BatchSink, DeliveryBatch, Level, Pipeline, PipelineConfig, SinkError};
//!
//! #[derive(Debug)]
//! struct Stdout;
//!
//! #[async_trait::async_trait]
//! impl BatchSink for Stdout {
//!     async fn send(&self, batch: &DeliveryBatch) -> Result<(), SinkError> {
//!         for event in &batch.events {
//!             println!("{} {}", event.level(), event.message());
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let pipeline = Pipeline::builder(PipelineConfig::new("checkout", "shop")).sink(Stdout).start()?;
//! pipeline.log(Level::Info, "order placed");
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::{DeliveryBatch, LogBuffer};
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, TokioClock};
use crate::config::PipelineConfig;
use crate::correlation::CorrelationContext;
use crate::delivery::{BatchSink, DeliveryManager, DeliveryOutcome, DeliveryStats};
use crate::dynamic::DynamicConfig;
use crate::error::{ConfigError, LifecycleError};
use crate::event::{CapturedError, Level, LogEvent};
use crate::health::{HealthAggregator, HealthSnapshot};
use crate::metadata::MetadataProvider;
use crate::metrics::{incr, MetricsSnapshot, PipelineMetrics};
use crate::sampler::Sampler;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{BufferEvent, PipelineEvent, Telemetry};

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

enum Work {
    Batch(DeliveryBatch),
    /// Final batch at shutdown: one bounded attempt, then the worker exits.
    Drain { batch: DeliveryBatch, timeout: Duration, done: oneshot::Sender<DeliveryOutcome> },
}

/// How the shutdown drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Everything flushed before shutdown was handed to the sink (delivered or exhausted).
    Completed,
    /// The drain deadline passed; `dropped` undelivered events were counted as shutdown drops.
    TimedOut { dropped: u64 },
    /// The pipeline was never started or was already shut down.
    NotRunning,
}

struct Shared {
    config: DynamicConfig<PipelineConfig>,
    sampler: Arc<Sampler>,
    buffer: Arc<LogBuffer>,
    delivery: DeliveryManager,
    metrics: Arc<PipelineMetrics>,
    telemetry: Telemetry,
    health: HealthAggregator,
    correlation: CorrelationContext,
    metadata: Option<Arc<dyn MetadataProvider>>,
    queue: mpsc::Sender<Work>,
    /// Events flushed to the queue and not yet resolved by the worker.
    in_flight: AtomicU64,
    state: AtomicU8,
}

struct Tasks {
    timer: JoinHandle<()>,
    worker: JoinHandle<()>,
}

/// One log pipeline instance with an explicit start/shutdown lifecycle.
pub struct Pipeline {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::Receiver<Work>>>,
    tasks: Mutex<Option<Tasks>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cfg = self.shared.config.get();
        f.debug_struct("Pipeline")
            .field("service_name", &cfg.service_name)
            .field("namespace", &cfg.namespace)
            .field("state", &self.shared.state.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Pipeline`].
#[must_use]
pub struct PipelineBuilder {
    config: PipelineConfig,
    sink: Option<Arc<dyn BatchSink>>,
    telemetry: Telemetry,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Arc<dyn Sleeper>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    rng_seed: Option<u64>,
}

impl PipelineBuilder {
    /// Where delivered batches go. Required.
    pub fn sink<S: BatchSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Time source for sampling windows, flush deadlines and the breaker cooldown.
    /// Defaults to [`TokioClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Used for retry backoff waits.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn metadata_provider<P: MetadataProvider + 'static>(mut self, provider: P) -> Self {
        self.metadata = Some(Arc::new(provider));
        self
    }

    /// Deterministic sampling draws.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Pipeline, ConfigError> {
        self.config.validate()?;
        let sink = self.sink.ok_or_else(|| ConfigError::single("a batch sink is required"))?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock::default()));

        let mut sampler = Sampler::new(config.sampling.clone()).with_clock(clock.clone());
        if let Some(seed) = self.rng_seed {
            sampler = sampler.with_rng_seed(seed);
        }
        let sampler = Arc::new(sampler);
        let buffer = Arc::new(LogBuffer::with_clock(config.buffer.clone(), clock.clone()));
        let breaker = CircuitBreaker::from_config(&config.breaker)
            .map_err(|e| ConfigError::single(format!("breaker: {}", e)))?
            .with_clock(clock.clone());
        let stats = Arc::new(DeliveryStats::new(config.health.error_rate_window, clock.clone()));
        let metrics = Arc::new(PipelineMetrics::new());

        let delivery = DeliveryManager::new(sink, &config.retry, breaker.clone())?
            .with_sleeper(self.sleeper)
            .with_clock(clock.clone())
            .with_stats(stats.clone())
            .with_metrics(metrics.clone())
            .with_telemetry(self.telemetry.clone());
        let health = HealthAggregator::new(
            buffer.clone(),
            breaker,
            stats,
            sampler.clone(),
            metrics.clone(),
            config.health.clone(),
            clock.clone(),
        );

        let (queue, receiver) = mpsc::channel(config.queue_capacity);
        let shared = Shared {
            config: DynamicConfig::new(config),
            sampler,
            buffer,
            delivery,
            metrics,
            telemetry: self.telemetry,
            health,
            correlation: CorrelationContext::with_clock(clock),
            metadata: self.metadata,
            queue,
            in_flight: AtomicU64::new(0),
            state: AtomicU8::new(CREATED),
        };
        Ok(Pipeline {
            shared: Arc::new(shared),
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(None),
        })
    }

    /// [`build`](Self::build) and [`init`](Pipeline::init) in one step.
    pub fn start(self) -> Result<Pipeline, Box<dyn std::error::Error + Send + Sync>> {
        let pipeline = self.build()?;
        pipeline.init()?;
        Ok(pipeline)
    }
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            sink: None,
            telemetry: Telemetry::default(),
            clock: None,
            sleeper: Arc::new(TokioSleeper),
            metadata: None,
            rng_seed: None,
        }
    }

    /// Spawn the flush timer and the delivery worker on the current tokio runtime.
    pub fn init(&self) -> Result<(), LifecycleError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;
        match self.shared.state.compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {}
            Err(RUNNING) => return Err(LifecycleError::AlreadyStarted),
            Err(_) => return Err(LifecycleError::ShutDown),
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(LifecycleError::AlreadyStarted)?;

        let timer = handle.spawn(run_flush_timer(self.shared.clone()));
        let worker = handle.spawn(run_worker(self.shared.clone(), receiver));
        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = Some(Tasks { timer, worker });

        let cfg = self.shared.config.get();
        tracing::info!(service = %cfg.service_name, namespace = %cfg.namespace, "log pipeline started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == RUNNING
    }

    /// Build an event stamped with this pipeline's service name and namespace.
    pub fn event(&self, level: Level, message: impl Into<String>) -> LogEvent {
        let cfg = self.shared.config.get();
        LogEvent::new(level, message, cfg.service_name.as_str(), cfg.namespace.as_str())
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        self.emit(self.event(level, message));
    }

    /// Emit a captured error as an ERROR event.
    pub fn log_error(&self, error: &CapturedError) {
        let cfg = self.shared.config.get();
        self.emit(LogEvent::from_error(error, cfg.service_name.as_str(), cfg.namespace.as_str()));
    }

    /// Hand an event to the pipeline. Never blocks on I/O and never fails.
    pub fn emit(&self, event: LogEvent) {
        let shared = &self.shared;
        incr(&shared.metrics.ingested, 1);
        if shared.state.load(Ordering::Acquire) >= STOPPING {
            incr(&shared.metrics.dropped_shutdown, 1);
            return;
        }

        let event = shared.enrich(event);
        if !shared.sampler.decide(&event) {
            incr(&shared.metrics.sampled_out, 1);
            return;
        }

        let outcome = shared.buffer.enqueue(event);
        incr(&shared.metrics.buffered, 1);
        if outcome.dropped_oldest {
            incr(&shared.metrics.dropped_overflow, 1);
        }
        if shared.state.load(Ordering::Acquire) == STOPPED {
            // Shutdown finished while this event was on its way in; nothing will flush it.
            shared.drop_stranded();
            return;
        }
        if outcome.flush_due {
            if let Some(batch) = shared.buffer.flush_if_due() {
                shared.dispatch(batch);
            }
        }
    }

    /// Move whatever is buffered to the delivery queue now.
    pub fn flush(&self) {
        let batch = self.shared.buffer.force_flush();
        self.shared.dispatch(batch);
    }

    /// Validate `config` and swap in its sampling and buffer settings.
    ///
    /// Retry, breaker and queue settings stay as they were built.
    pub fn reconfigure(&self, config: PipelineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let shared = &self.shared;
        shared.sampler.reconfigure(config.sampling.clone());
        let before = shared.buffer.dropped_events();
        shared.buffer.reconfigure(config.buffer.clone());
        let trimmed = shared.buffer.dropped_events().saturating_sub(before);
        if trimmed > 0 {
            incr(&shared.metrics.dropped_overflow, trimmed);
        }
        shared.config.set(config);
        tracing::info!(trimmed, "pipeline reconfigured");
        Ok(())
    }

    /// Stop the timer, flush, and wait at most `drain_timeout` for delivery to finish.
    ///
    /// Queued batches are delivered under the normal retry policy; the final flush gets one
    /// bounded attempt. Whatever is still undelivered at the deadline is counted as dropped.
    pub async fn shutdown(&self) -> DrainOutcome {
        let shared = &self.shared;
        if shared
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if shared.state.compare_exchange(CREATED, STOPPED, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                let left = shared.buffer.clear() as u64;
                incr(&shared.metrics.dropped_shutdown, left);
            }
            return DrainOutcome::NotRunning;
        }

        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(Tasks { timer, worker }) = tasks else {
            shared.state.store(STOPPED, Ordering::Release);
            return DrainOutcome::NotRunning;
        };
        timer.abort();

        let cfg = shared.config.get();
        let batch = shared.buffer.force_flush();
        let events = batch.len() as u64;
        incr(&shared.metrics.flushed, events);
        shared.in_flight.fetch_add(events, Ordering::AcqRel);

        let attempt_timeout = cfg.retry.attempt_timeout.min(cfg.drain_timeout);
        let (done, finished) = oneshot::channel();
        let drain = async {
            shared
                .queue
                .send(Work::Drain { batch, timeout: attempt_timeout, done })
                .await
                .ok()?;
            finished.await.ok()
        };

        let outcome = match tokio::time::timeout(cfg.drain_timeout, drain).await {
            Ok(Some(_)) => {
                let _ = worker.await;
                DrainOutcome::Completed
            }
            _ => {
                worker.abort();
                let _ = worker.await;
                let dropped = shared.in_flight.swap(0, Ordering::AcqRel);
                incr(&shared.metrics.dropped_shutdown, dropped);
                tracing::warn!(dropped, timeout = ?cfg.drain_timeout, "shutdown drain timed out");
                shared
                    .telemetry
                    .emit(PipelineEvent::Buffer(BufferEvent::ShutdownDropped { events: dropped }))
                    .await;
                DrainOutcome::TimedOut { dropped }
            }
        };
        shared.state.store(STOPPED, Ordering::Release);
        shared.drop_stranded();
        tracing::info!(service = %cfg.service_name, ?outcome, "log pipeline stopped");
        outcome
    }

    pub fn health(&self) -> HealthSnapshot {
        self.shared.health.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn config(&self) -> Arc<PipelineConfig> {
        self.shared.config.get()
    }

    pub fn sampler(&self) -> &Sampler {
        &self.shared.sampler
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.shared.buffer
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.shared.delivery.breaker()
    }

    /// Span tracking for this pipeline. Finished spans older than `span_retention` are
    /// dropped by the flush timer, so a stopped or never-started pipeline keeps them.
    pub fn correlation(&self) -> &CorrelationContext {
        &self.shared.correlation
    }

    /// Events flushed but not yet delivered, exhausted or dropped.
    pub fn in_flight(&self) -> u64 {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take() {
            tasks.timer.abort();
            tasks.worker.abort();
        }
        let shared = &self.shared;
        if shared.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }
        let dropped = shared.buffer.clear() as u64 + shared.in_flight.swap(0, Ordering::AcqRel);
        if dropped > 0 {
            incr(&shared.metrics.dropped_shutdown, dropped);
            tracing::warn!(dropped, "log pipeline dropped without shutdown");
            shared
                .telemetry
                .emit_detached(PipelineEvent::Buffer(BufferEvent::ShutdownDropped { events: dropped }));
        }
    }
}

impl Shared {
    /// Take up to `n` events out of the in-flight count, returning how many were taken.
    ///
    /// Shutdown may already have counted them; whoever takes an event out counts it.
    fn release(&self, n: u64) -> u64 {
        let prev = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)))
            .unwrap_or_else(|v| v);
        prev.min(n)
    }

    /// Count whatever is left behind once the pipeline has stopped.
    fn drop_stranded(&self) {
        let stranded = self.buffer.clear() as u64 + self.in_flight.swap(0, Ordering::AcqRel);
        if stranded > 0 {
            incr(&self.metrics.dropped_shutdown, stranded);
            tracing::warn!(stranded, "events arrived after shutdown; dropped");
        }
    }

    fn enrich(&self, event: LogEvent) -> LogEvent {
        let Some(provider) = &self.metadata else {
            return event;
        };
        match provider.fields() {
            Ok(fields) => event.with_metadata_defaults(fields.iter().map(|(k, v)| (k.clone(), v.clone()))),
            Err(err) => {
                incr(&self.metrics.enrichment_failures, 1);
                tracing::debug!(error = %err, "metadata enrichment skipped");
                event
            }
        }
    }

    /// Queue a flushed batch for the worker without waiting.
    fn dispatch(&self, batch: DeliveryBatch) {
        if batch.is_empty() {
            return;
        }
        let (batch_id, events) = (batch.sequence, batch.len());
        incr(&self.metrics.flushed, events as u64);
        self.in_flight.fetch_add(events as u64, Ordering::AcqRel);

        match self.queue.try_send(Work::Batch(batch)) {
            Ok(()) => {
                self.telemetry
                    .emit_detached(PipelineEvent::Buffer(BufferEvent::Flushed { batch_id, events }));
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.release(events as u64);
                incr(&self.metrics.dropped_queue_full, dropped);
                tracing::warn!(batch_id, events, "delivery queue full; batch dropped");
                self.telemetry
                    .emit_detached(PipelineEvent::Buffer(BufferEvent::QueueFull { batch_id, events }));
            }
            Err(TrySendError::Closed(_)) => {
                let dropped = self.release(events as u64);
                incr(&self.metrics.dropped_shutdown, dropped);
            }
        }
    }
}

async fn run_flush_timer(shared: Arc<Shared>) {
    loop {
        let wait = shared.buffer.time_until_due().max(Duration::from_millis(1));
        tokio::time::sleep(wait).await;
        shared.sampler.rotate();
        if let Some(batch) = shared.buffer.flush_if_due() {
            shared.dispatch(batch);
        }
        let retention = shared.config.get().span_retention;
        let forgotten = shared.correlation.cleanup_finished(retention);
        if forgotten > 0 {
            tracing::trace!(forgotten, "finished spans expired");
        }
    }
}

async fn run_worker(shared: Arc<Shared>, mut receiver: mpsc::Receiver<Work>) {
    while let Some(work) = receiver.recv().await {
        match work {
            Work::Batch(batch) => {
                let events = batch.len() as u64;
                shared.delivery.send_batch(batch).await;
                shared.release(events);
            }
            Work::Drain { batch, timeout, done } => {
                let events = batch.len() as u64;
                let outcome = shared.delivery.deliver_once(batch, timeout).await;
                shared.release(events);
                let _ = done.send(outcome);
                break;
            }
        }
    }
    // Batches flushed while the drain was running are never delivered.
    receiver.close();
    while let Ok(work) = receiver.try_recv() {
        let (Work::Batch(batch) | Work::Drain { batch, .. }) = work;
        let dropped = shared.release(batch.len() as u64);
        incr(&shared.metrics.dropped_shutdown, dropped);
    }
}
