//! Convenient re-exports for common logrelay types.
pub use crate::{
    correlation::CorrelationContext,
    delivery::BatchSink,
    error::{ConfigError, SinkError},
    event::{CapturedError, CorrelationId, Level, LogEvent},
    health::{HealthSnapshot, HealthStatus},
    markup::{RiskSeverity, TaskKind},
    metadata::{MetadataProvider, StaticMetadata},
    pipeline::{DrainOutcome, Pipeline},
    telemetry::{MemorySink, PipelineEvent, Telemetry},
    DeliveryBatch, PipelineConfig,
};
