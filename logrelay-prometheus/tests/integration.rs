use std::sync::Arc;
use std::time::Duration;

use logrelay::telemetry::{BufferEvent, CircuitEvent, DeliveryEvent, PipelineEvent};
use logrelay::{
    BatchSink, DeliveryBatch, Level, Pipeline, PipelineConfig, SinkError, Telemetry,
};
use logrelay_prometheus::PrometheusSink;
use prometheus::{Encoder, Registry, TextEncoder};
use tower_service::Service;

fn get_counter_value(registry: &Registry, event_type: &str) -> f64 {
    let metric_families = registry.gather();
    let events_metric = metric_families.iter().find(|mf| mf.get_name() == "logrelay_events_total");

    if let Some(metric) = events_metric {
        if let Some(m) = metric.get_metric().iter().find(|m| {
            m.get_label().iter().any(|l| l.get_name() == "event" && l.get_value() == event_type)
        }) {
            if let Some(c) = m.get_counter().as_ref() {
                return c.value();
            }
        }
    }
    0.0
}

fn exposition(registry: &Registry) -> String {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf).expect("encode");
    String::from_utf8(buf).expect("utf8")
}

#[tokio::test]
async fn circuit_variants_are_counted() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let cases = [
        (PipelineEvent::Circuit(CircuitEvent::Opened { consecutive_failures: 5 }), "opened"),
        (PipelineEvent::Circuit(CircuitEvent::HalfOpen), "half_open"),
        (PipelineEvent::Circuit(CircuitEvent::Closed), "closed"),
        (
            PipelineEvent::Circuit(CircuitEvent::Rejected {
                batch_id: 1,
                open_for: Duration::from_secs(2),
            }),
            "rejected",
        ),
    ];

    for (event, label) in cases {
        sink.call(event).await.expect("Failed to call sink with circuit event");
        assert_eq!(get_counter_value(&registry, label), 1.0);
    }
}

#[tokio::test]
async fn delivery_and_buffer_events_accumulate() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let retry = PipelineEvent::Delivery(DeliveryEvent::RetryScheduled {
        batch_id: 4,
        attempt: 1,
        delay: Duration::from_millis(100),
    });
    assert_eq!(get_counter_value(&registry, "retry_scheduled"), 0.0);
    sink.call(retry.clone()).await.expect("call");
    sink.call(retry).await.expect("call");
    sink.call(PipelineEvent::Buffer(BufferEvent::QueueFull { batch_id: 5, events: 10 }))
        .await
        .expect("call");

    assert_eq!(get_counter_value(&registry, "retry_scheduled"), 2.0);
    assert_eq!(get_counter_value(&registry, "queue_full"), 1.0);
}

#[test]
fn duplicate_registration_is_an_error() {
    let registry = Arc::new(Registry::new());
    let _first = PrometheusSink::new(registry.clone()).expect("first registration");
    assert!(PrometheusSink::new(registry).is_err());
}

#[derive(Debug)]
struct Refusing;

#[async_trait::async_trait]
impl BatchSink for Refusing {
    async fn send(&self, _batch: &DeliveryBatch) -> Result<(), SinkError> {
        Err(SinkError::Transport("down".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn pipeline_telemetry_and_health_reach_the_registry() {
    let registry = Registry::new();
    let sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let mut cfg = PipelineConfig::new("api", "prod");
    cfg.buffer.max_size = 1;
    cfg.breaker.failure_threshold = 1;
    cfg.retry.max_attempts = 1;
    let pipeline = Pipeline::builder(cfg)
        .sink(Refusing)
        .telemetry(Telemetry::new(sink.clone()))
        .start()
        .expect("pipeline starts");

    pipeline.log(Level::Info, "lost");
    while pipeline.in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // Telemetry is emitted on detached tasks.
    tokio::time::sleep(Duration::from_millis(100)).await;

    sink.observe_health(&pipeline.health());
    let text = exposition(&registry);

    assert_eq!(get_counter_value(&registry, "opened"), 1.0);
    assert_eq!(get_counter_value(&registry, "exhausted"), 1.0);
    assert!(text.contains("logrelay_component_score{component=\"circuit_breaker\"} 0"));
    assert!(text.contains("logrelay_pipeline_count{counter=\"dropped_delivery\"} 1"));
    assert!(text.contains("logrelay_health_score 0."));
    pipeline.shutdown().await;
}
