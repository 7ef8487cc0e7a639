mod common;

use std::time::Duration;

use common::{settle, ScriptedSink};
use logrelay::health::{BUFFER, CIRCUIT_BREAKER, DELIVERY};
use logrelay::{HealthStatus, Level, Pipeline, PipelineConfig};

fn config() -> PipelineConfig {
    let mut cfg = PipelineConfig::new("billing", "prod");
    cfg.buffer.max_size = 10;
    cfg.buffer.flush_interval = Duration::from_secs(60);
    cfg.breaker.failure_threshold = 2;
    cfg
}

#[tokio::test(start_paused = true)]
async fn fresh_pipeline_is_ready_and_alive() {
    let pipeline = Pipeline::builder(config()).sink(ScriptedSink::healthy()).start().unwrap();
    let snap = pipeline.health();

    assert_eq!(snap.status, HealthStatus::Healthy);
    assert!(snap.is_ready() && snap.is_alive());
    assert!(snap.alerts.is_empty());
    assert_eq!(snap.metrics.health_score, 1.0);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_sink_turns_pipeline_unhealthy() {
    let pipeline = Pipeline::builder(config()).sink(ScriptedSink::always_failing()).start().unwrap();
    for i in 0..10 {
        pipeline.log(Level::Info, format!("m{i}"));
    }
    settle(&pipeline).await;

    let snap = pipeline.health();
    assert_eq!(snap.component(CIRCUIT_BREAKER).unwrap().status, HealthStatus::Unhealthy);
    assert_eq!(snap.component(DELIVERY).unwrap().status, HealthStatus::Unhealthy);
    assert_eq!(snap.status, HealthStatus::Unhealthy);
    assert!(!snap.is_ready());
    assert!(snap.is_alive(), "producers can still emit");
    assert!(snap.alerts.iter().any(|a| a.contains("circuit breaker open")));
    assert_eq!(snap.metrics.dropped_delivery, 10);
    assert!((pipeline.metrics().health_score - snap.score).abs() < f64::EPSILON);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn buffer_pressure_is_reported_before_overflow() {
    let pipeline = Pipeline::builder(config()).sink(ScriptedSink::healthy()).build().unwrap();
    for i in 0..9 {
        pipeline.log(Level::Info, format!("m{i}"));
    }
    let snap = pipeline.health();
    assert_eq!(snap.component(BUFFER).unwrap().status, HealthStatus::Degraded);
    assert!(snap.alerts.iter().any(|a| a.contains("buffer usage high")));
    // 0.3 * 0.1 + 0.3 + 0.3 + 0.1
    assert!((snap.score - 0.73).abs() < 1e-9);
    assert_eq!(snap.status, HealthStatus::Degraded);
    assert!(snap.is_ready());
}

#[tokio::test(start_paused = true)]
async fn health_polls_do_not_disturb_the_pipeline() {
    let pipeline = Pipeline::builder(config()).sink(ScriptedSink::healthy()).build().unwrap();
    pipeline.log(Level::Info, "only");
    let before = pipeline.metrics();
    for _ in 0..5 {
        pipeline.health();
    }
    let after = pipeline.metrics();
    assert_eq!(pipeline.buffer().len(), 1);
    assert_eq!(before.ingested, after.ingested);
    assert_eq!(pipeline.sampler().statistics().observed, 1);
}

#[cfg(feature = "json")]
#[tokio::test(start_paused = true)]
async fn snapshot_serializes_for_health_endpoints() {
    let pipeline = Pipeline::builder(config()).sink(ScriptedSink::healthy()).build().unwrap();
    let json = serde_json::to_value(pipeline.health()).unwrap();
    assert_eq!(json["status"], "healthy");
    assert!(json["components"]["circuit_breaker"]["score"].is_number());
    assert_eq!(json["metrics"]["ingested"], 0);
}
