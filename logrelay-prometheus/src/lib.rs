//! Prometheus metrics for `logrelay`.
//! Bring your own `prometheus::Registry`; metrics are registered into it.

use logrelay::telemetry::{BufferEvent, CircuitEvent, DeliveryEvent, PipelineEvent};
use logrelay::{HealthSnapshot, HealthStatus};
use prometheus::{Gauge, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    health_score: Gauge,
    component_score: GaugeVec,
    counts: IntGaugeVec,
}

impl PrometheusSink {
    /// Create a sink and register its metrics into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            Opts::new("logrelay_events_total", "Pipeline telemetry events"),
            &["category", "event"],
        )?;
        let health_score =
            Gauge::with_opts(Opts::new("logrelay_health_score", "Weighted pipeline health in [0, 1]"))?;
        let component_score = GaugeVec::new(
            Opts::new("logrelay_component_score", "Per-component health score in [0, 1]"),
            &["component"],
        )?;
        let counts = IntGaugeVec::new(
            Opts::new("logrelay_pipeline_count", "Pipeline counters as of the last health snapshot"),
            &["counter"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(health_score.clone()))?;
        registry.register(Box::new(component_score.clone()))?;
        registry.register(Box::new(counts.clone()))?;
        Ok(Self { registry, events, health_score, component_score, counts })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mirror a health snapshot into the gauges.
    pub fn observe_health(&self, snapshot: &HealthSnapshot) {
        self.health_score.set(snapshot.score);
        for (name, component) in &snapshot.components {
            self.component_score.with_label_values(&[name.as_str()]).set(component.score);
        }
        for (counter, value) in snapshot.metrics.counters() {
            self.counts.with_label_values(&[counter]).set(i64::try_from(value).unwrap_or(i64::MAX));
        }
        if snapshot.status == HealthStatus::Unhealthy {
            tracing::debug!(score = snapshot.score, "exporting unhealthy pipeline snapshot");
        }
    }
}

fn labels(event: &PipelineEvent) -> (&'static str, &'static str) {
    match event {
        PipelineEvent::Circuit(c) => (
            "circuit",
            match c {
                CircuitEvent::Opened { .. } => "opened",
                CircuitEvent::HalfOpen => "half_open",
                CircuitEvent::Closed => "closed",
                CircuitEvent::Rejected { .. } => "rejected",
            },
        ),
        PipelineEvent::Delivery(d) => (
            "delivery",
            match d {
                DeliveryEvent::Attempt { .. } => "attempt",
                DeliveryEvent::Succeeded { .. } => "succeeded",
                DeliveryEvent::Failed { .. } => "failed",
                DeliveryEvent::RetryScheduled { .. } => "retry_scheduled",
                DeliveryEvent::Exhausted { .. } => "exhausted",
            },
        ),
        PipelineEvent::Buffer(b) => (
            "buffer",
            match b {
                BufferEvent::Flushed { .. } => "flushed",
                BufferEvent::QueueFull { .. } => "queue_full",
                BufferEvent::ShutdownDropped { .. } => "shutdown_dropped",
            },
        ),
    }
}

impl tower_service::Service<PipelineEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        let (category, name) = labels(&event);
        self.events.with_label_values(&[category, name]).inc();
        ready(Ok(()))
    }
}
