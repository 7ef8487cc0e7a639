//! Telemetry events describing what the pipeline did with batches.
//!
//! The delivery worker and the flush path emit [`PipelineEvent`]s through a [`TelemetrySink`],
//! which is any cloneable `tower::Service<PipelineEvent>`. Emission is best-effort: a sink that is
//! not ready or returns an error just loses the event, and the pipeline carries on.
//!
//! ```rust
//! use logrelay::telemetry::{DeliveryEvent, PipelineEvent};
//! use std::time::Duration;
//!
//! let retry = PipelineEvent::Delivery(DeliveryEvent::RetryScheduled {
//!     batch_id: 7,
//!     attempt: 1,
//!     delay: Duration::from_millis(800),
//! });
//! assert_eq!(retry.to_string(), "Delivery::RetryScheduled(batch=7, #1, delay=800ms)");
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

use crate::circuit_breaker::{CircuitState, CircuitTransition};

/// A telemetry sink that consumes pipeline events.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use logrelay::telemetry::{PipelineEvent, TelemetrySink};
/// use tower::Service;
/// use std::task::{Context, Poll};
/// use std::pin::Pin;
/// use std::future::Future;
///
/// #[derive(Clone)]
/// struct MySink;
///
/// impl Service<PipelineEvent> for MySink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: PipelineEvent) -> Self::Future {
///         println!("Received event: {}", event);
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// ```
pub trait TelemetrySink:
    Service<PipelineEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: Into<BoxError> + Send + 'static;
}

impl<S> TelemetrySink for S
where
    S: Service<PipelineEvent, Response = ()> + Clone + Send + 'static,
    S::Error: Into<BoxError> + Send + 'static,
{
    type SinkError = S::Error;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: PipelineEvent)
where
    S: Service<PipelineEvent, Response = ()> + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events the pipeline emits.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Circuit(CircuitEvent),
    Delivery(DeliveryEvent),
    Buffer(BufferEvent),
}

/// Circuit breaker state changes and fast-fail rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    Opened { consecutive_failures: u32 },
    HalfOpen,
    Closed,
    /// An attempt was refused without calling the sink.
    Rejected { batch_id: u64, open_for: Duration },
}

impl CircuitEvent {
    pub(crate) fn from_transition(t: CircuitTransition) -> Self {
        match t.to {
            CircuitState::Open => CircuitEvent::Opened { consecutive_failures: t.consecutive_failures },
            CircuitState::HalfOpen => CircuitEvent::HalfOpen,
            CircuitState::Closed => CircuitEvent::Closed,
        }
    }
}

/// Batch delivery progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Attempt { batch_id: u64, attempt: u32, events: usize },
    Succeeded { batch_id: u64, attempts: u32, events: usize, duration: Duration },
    Failed { batch_id: u64, attempt: u32, reason: String },
    RetryScheduled { batch_id: u64, attempt: u32, delay: Duration },
    Exhausted { batch_id: u64, attempts: u32, events: usize },
}

/// Flush-path events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    Flushed { batch_id: u64, events: usize },
    /// The delivery queue was full; the batch was dropped.
    QueueFull { batch_id: u64, events: usize },
    /// Events still undelivered when the shutdown drain timed out.
    ShutdownDropped { events: u64 },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Circuit(event) => write!(f, "Circuit::{}", event),
            PipelineEvent::Delivery(event) => write!(f, "Delivery::{}", event),
            PipelineEvent::Buffer(event) => write!(f, "Buffer::{}", event),
        }
    }
}

impl fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitEvent::Opened { consecutive_failures } => {
                write!(f, "Opened(failures={})", consecutive_failures)
            }
            CircuitEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitEvent::Closed => write!(f, "Closed"),
            CircuitEvent::Rejected { batch_id, open_for } => {
                write!(f, "Rejected(batch={}, open_for={:?})", batch_id, open_for)
            }
        }
    }
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryEvent::Attempt { batch_id, attempt, events } => {
                write!(f, "Attempt(batch={}, #{}, events={})", batch_id, attempt, events)
            }
            DeliveryEvent::Succeeded { batch_id, attempts, events, duration } => write!(
                f,
                "Succeeded(batch={}, attempts={}, events={}, duration={:?})",
                batch_id, attempts, events, duration
            ),
            DeliveryEvent::Failed { batch_id, attempt, reason } => {
                write!(f, "Failed(batch={}, #{}, reason={})", batch_id, attempt, reason)
            }
            DeliveryEvent::RetryScheduled { batch_id, attempt, delay } => {
                write!(f, "RetryScheduled(batch={}, #{}, delay={:?})", batch_id, attempt, delay)
            }
            DeliveryEvent::Exhausted { batch_id, attempts, events } => {
                write!(f, "Exhausted(batch={}, attempts={}, events={})", batch_id, attempts, events)
            }
        }
    }
}

impl fmt::Display for BufferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferEvent::Flushed { batch_id, events } => {
                write!(f, "Flushed(batch={}, events={})", batch_id, events)
            }
            BufferEvent::QueueFull { batch_id, events } => {
                write!(f, "QueueFull(batch={}, events={})", batch_id, events)
            }
            BufferEvent::ShutdownDropped { events } => write!(f, "ShutdownDropped(events={})", events),
        }
    }
}

type BoxedSink = BoxCloneService<PipelineEvent, (), BoxError>;

/// Type-erased, shareable handle to the configured telemetry sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxedSink>>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let boxed = BoxCloneService::new(sink.map_err(|e: S::SinkError| -> BoxError { e.into() }));
        Self { sink: Arc::new(Mutex::new(boxed)) }
    }

    /// Emit and wait for the sink to accept (or refuse) the event.
    pub async fn emit(&self, event: PipelineEvent) {
        emit_best_effort(self.service(), event).await;
    }

    /// Emit without waiting; dropped when no tokio runtime is running.
    pub fn emit_detached(&self, event: PipelineEvent) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(emit_best_effort(self.service(), event));
        }
    }

    fn service(&self) -> BoxedSink {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

type ReadyFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PipelineEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PipelineEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Circuit openings, exhausted batches and dropped batches log at WARN; everything else at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PipelineEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        match &event {
            PipelineEvent::Circuit(CircuitEvent::Opened { .. })
            | PipelineEvent::Delivery(DeliveryEvent::Exhausted { .. })
            | PipelineEvent::Buffer(BufferEvent::QueueFull { .. })
            | PipelineEvent::Buffer(BufferEvent::ShutdownDropped { .. }) => {
                tracing::warn!(event = %event, "pipeline_event")
            }
            _ => tracing::debug!(event = %event, "pipeline_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

/// A telemetry sink that stores events in memory.
///
/// Bounded: once `capacity` is reached the oldest event is evicted and counted. Clones share
/// storage, so a test can keep one handle and give another to the pipeline.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<PipelineEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PipelineEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PipelineEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flushed(batch_id: u64) -> PipelineEvent {
        PipelineEvent::Buffer(BufferEvent::Flushed { batch_id, events: 3 })
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        sink.call(flushed(1)).await.unwrap();
        sink.call(flushed(2)).await.unwrap();
        sink.call(flushed(3)).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events(), vec![flushed(2), flushed(3)]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn telemetry_handle_forwards_to_shared_memory_sink() {
        let memory = MemorySink::new();
        let telemetry = Telemetry::new(memory.clone());

        telemetry.emit(PipelineEvent::Circuit(CircuitEvent::HalfOpen)).await;
        telemetry.emit(flushed(9)).await;

        assert_eq!(memory.events(), vec![PipelineEvent::Circuit(CircuitEvent::HalfOpen), flushed(9)]);
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_errors() {
        #[derive(Clone)]
        struct Fails;
        impl Service<PipelineEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _req: PipelineEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "fail")) })
            }
        }

        Telemetry::new(Fails).emit(flushed(1)).await;
        emit_best_effort(LogSink, flushed(2)).await;
        emit_best_effort(NullSink, flushed(3)).await;
    }

    #[test]
    fn transitions_map_to_events() {
        let t = CircuitTransition {
            from: CircuitState::Closed,
            to: CircuitState::Open,
            consecutive_failures: 3,
        };
        assert_eq!(CircuitEvent::from_transition(t), CircuitEvent::Opened { consecutive_failures: 3 });
        assert_eq!(
            PipelineEvent::Circuit(CircuitEvent::from_transition(t)).to_string(),
            "Circuit::Opened(failures=3)"
        );
    }
}
