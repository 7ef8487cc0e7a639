#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # logrelay
//!
//! A log event pipeline that stays out of the caller's way: adaptive sampling, a bounded
//! lossy buffer, and batched delivery with retry, backoff and circuit breaking, all reporting
//! into a composite health snapshot.
//!
//! ## Features
//!
//! - **Adaptive sampling** with per-level rates scaled down under volume pressure
//! - **Bounded buffering** that drops the oldest event instead of blocking producers
//! - **Ordered delivery** through a single worker with jittered exponential backoff
//! - **Circuit breaking** with a single half-open trial
//! - **Health and metrics** snapshots for readiness/liveness endpoints
//! - **Telemetry** as a `tower::Service<PipelineEvent>` sink
//!
//! ## Quick Start
//!
//! ```rust
//! use logrelay::{BatchSink, DeliveryBatch, Level, Pipeline, PipelineConfig, SinkError};
//!
//! #[derive(Debug)]
//! struct Discard;
//!
//! #[async_trait::async_trait]
//! impl BatchSink for Discard {
//!     async fn send(&self, _batch: &DeliveryBatch) -> Result<(), SinkError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = Pipeline::builder(PipelineConfig::production().with_service("api", "prod"))
//!         .sink(Discard)
//!         .start()
//!         .expect("valid configuration");
//!
//!     let id = pipeline.correlation().start("checkout");
//!     let event = pipeline.event(Level::Info, "order placed");
//!     pipeline.emit(pipeline.correlation().attach(event, &id));
//!     pipeline.correlation().end(&id, true);
//!
//!     assert!(pipeline.health().is_alive());
//!     pipeline.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod buffer;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod correlation;
pub mod delivery;
pub mod dynamic;
pub mod error;
pub mod event;
pub mod health;
pub mod jitter;
pub mod markup;
pub mod metadata;
pub mod metrics;
pub mod pipeline;
pub mod prelude;
pub mod sampler;
pub mod sleeper;
pub mod telemetry;
mod window;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use buffer::{DeliveryBatch, EnqueueOutcome, LogBuffer};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerError, CircuitBreakerSnapshot, CircuitState,
    CircuitTransition,
};
pub use clock::{Clock, ManualClock, MonotonicClock, TokioClock};
pub use config::{
    BufferConfig, CircuitBreakerConfig, HealthConfig, HealthWeights, PipelineConfig, RetryConfig,
    SamplingConfig,
};
pub use correlation::{CorrelationContext, SpanRecord, TraceParent};
pub use delivery::{BatchSink, DeliveryManager, DeliveryOutcome, DeliveryStats};
pub use dynamic::DynamicConfig;
pub use error::{ConfigError, LifecycleError, PipelineError, SinkError};
pub use event::{CapturedError, CorrelationId, Level, LogEvent, Metadata};
pub use health::{ComponentHealth, HealthAggregator, HealthSnapshot, HealthStatus};
pub use jitter::{Jitter, JitterError};
pub use markup::{RiskSeverity, TaskKind};
pub use metadata::{MetadataError, MetadataProvider, StaticMetadata};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{DrainOutcome, Pipeline, PipelineBuilder};
pub use sampler::{Sampler, SamplingDecision, SamplingReason, SamplingStatistics};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{
    BufferEvent, CircuitEvent, DeliveryEvent, LogSink, MemorySink, NullSink, PipelineEvent,
    Telemetry, TelemetrySink,
};
