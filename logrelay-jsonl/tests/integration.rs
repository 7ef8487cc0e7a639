use logrelay::{DrainOutcome, Level, Pipeline, PipelineConfig, Telemetry};
use logrelay_jsonl::{JsonlSink, JsonlTelemetrySink};
use tempfile::tempdir;
use tower_service::Service;

fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("read jsonl output")
        .lines()
        .map(|l| serde_json::from_str(l).expect("valid json line"))
        .collect()
}

#[tokio::test]
async fn pipeline_writes_delivered_events_in_order() {
    let dir = tempdir().expect("tempdir");
    let events_path = dir.path().join("events.jsonl");
    let telemetry_path = dir.path().join("pipeline.jsonl");

    let mut cfg = PipelineConfig::new("api", "prod");
    cfg.buffer.max_size = 2;
    let pipeline = Pipeline::builder(cfg)
        .sink(JsonlSink::new(&events_path))
        .telemetry(Telemetry::new(JsonlTelemetrySink::new(&telemetry_path)))
        .start()
        .expect("pipeline starts");

    for i in 0..5 {
        pipeline.log(Level::Warning, format!("m{i}"));
    }
    assert_eq!(pipeline.shutdown().await, DrainOutcome::Completed);

    let lines = read_lines(&events_path);
    let messages: Vec<&str> = lines.iter().map(|l| l["message"].as_str().unwrap()).collect();
    assert_eq!(messages, vec!["m0", "m1", "m2", "m3", "m4"]);
    assert!(lines.iter().all(|l| l["service_name"] == "api"));
    assert!(lines[0]["batch"].as_u64() < lines[4]["batch"].as_u64());
}

#[tokio::test]
async fn unwritable_path_is_a_transport_error() {
    use logrelay::{BatchSink, DeliveryBatch, LogEvent, SinkError};

    let dir = tempdir().expect("tempdir");
    let sink = JsonlSink::new(dir.path().join("missing").join("events.jsonl"));
    let batch = DeliveryBatch::new(1, vec![LogEvent::new(Level::Info, "x", "api", "prod")], 0);
    assert!(matches!(sink.send(&batch).await, Err(SinkError::Transport(_))));
}

#[tokio::test]
async fn telemetry_sink_appends_one_line_per_event() {
    use logrelay::telemetry::{BufferEvent, CircuitEvent, PipelineEvent};

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("telemetry.jsonl");
    let mut sink = JsonlTelemetrySink::new(&path);

    sink.call(PipelineEvent::Circuit(CircuitEvent::Opened { consecutive_failures: 5 }))
        .await
        .expect("write");
    sink.call(PipelineEvent::Buffer(BufferEvent::ShutdownDropped { events: 3 }))
        .await
        .expect("write");

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "circuit_opened");
    assert_eq!(lines[0]["failures"], 5);
    assert_eq!(lines[1]["kind"], "shutdown_dropped");
}
