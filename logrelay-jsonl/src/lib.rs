//! JSONL sinks for `logrelay`. One JSON object per line, appended.
//! Always writes; bring your own path.

use async_trait::async_trait;
use logrelay::telemetry::{BufferEvent, CircuitEvent, DeliveryEvent, PipelineEvent};
use logrelay::{BatchSink, DeliveryBatch, SinkError};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;

/// Appends every delivered event as a JSON line.
///
/// Each line carries the event's own fields plus `"batch"`, the batch sequence. A batch that
/// failed after a partial write may be offered again, so readers that need exactly-once should
/// drop repeated `(batch, position)` pairs.
#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Render a batch as newline-terminated JSON lines.
pub fn batch_to_lines(batch: &DeliveryBatch) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for event in &batch.events {
        let mut value = serde_json::to_value(event)?;
        if let Some(fields) = value.as_object_mut() {
            fields.insert("batch".into(), json!(batch.sequence));
        }
        out.push_str(&value.to_string());
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl BatchSink for JsonlSink {
    async fn send(&self, batch: &DeliveryBatch) -> Result<(), SinkError> {
        let lines = batch_to_lines(batch).map_err(|e| SinkError::Rejected(e.to_string()))?;
        append(&self.path, lines.as_bytes()).await.map_err(|e| {
            tracing::debug!(path = %self.path.display(), error = %e, "jsonl append failed");
            SinkError::Transport(e.to_string())
        })
    }
}

async fn append(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

/// Telemetry sink writing one line per [`PipelineEvent`].
#[derive(Clone, Debug)]
pub struct JsonlTelemetrySink {
    path: PathBuf,
}

impl JsonlTelemetrySink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl tower_service::Service<PipelineEvent> for JsonlTelemetrySink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move { append(&path, line.as_bytes()).await })
    }
}

/// Flat JSON rendering of a telemetry event; `kind` names the variant.
pub fn event_to_json(event: &PipelineEvent) -> serde_json::Value {
    match event {
        PipelineEvent::Circuit(c) => match c {
            CircuitEvent::Opened { consecutive_failures } => {
                json!({ "kind": "circuit_opened", "failures": consecutive_failures })
            }
            CircuitEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitEvent::Closed => json!({ "kind": "circuit_closed" }),
            CircuitEvent::Rejected { batch_id, open_for } => {
                json!({ "kind": "circuit_rejected", "batch": batch_id, "open_for_ms": open_for.as_millis() as u64 })
            }
        },
        PipelineEvent::Delivery(d) => match d {
            DeliveryEvent::Attempt { batch_id, attempt, events } => {
                json!({ "kind": "delivery_attempt", "batch": batch_id, "attempt": attempt, "events": events })
            }
            DeliveryEvent::Succeeded { batch_id, attempts, events, duration } => json!({
                "kind": "delivery_succeeded",
                "batch": batch_id,
                "attempts": attempts,
                "events": events,
                "duration_ms": duration.as_millis() as u64,
            }),
            DeliveryEvent::Failed { batch_id, attempt, reason } => {
                json!({ "kind": "delivery_failed", "batch": batch_id, "attempt": attempt, "reason": reason })
            }
            DeliveryEvent::RetryScheduled { batch_id, attempt, delay } => json!({
                "kind": "retry_scheduled",
                "batch": batch_id,
                "attempt": attempt,
                "delay_ms": delay.as_millis() as u64,
            }),
            DeliveryEvent::Exhausted { batch_id, attempts, events } => {
                json!({ "kind": "delivery_exhausted", "batch": batch_id, "attempts": attempts, "events": events })
            }
        },
        PipelineEvent::Buffer(b) => match b {
            BufferEvent::Flushed { batch_id, events } => {
                json!({ "kind": "buffer_flushed", "batch": batch_id, "events": events })
            }
            BufferEvent::QueueFull { batch_id, events } => {
                json!({ "kind": "queue_full", "batch": batch_id, "events": events })
            }
            BufferEvent::ShutdownDropped { events } => {
                json!({ "kind": "shutdown_dropped", "events": events })
            }
        },
    }
}
