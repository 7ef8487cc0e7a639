//! Composite pipeline health.
//!
//! [`HealthAggregator::snapshot`] only reads: buffer occupancy, breaker state, the trailing
//! delivery error rate and the sampler's volume scale. Each becomes a component score in `[0, 1]`;
//! the weighted mean is mapped to a [`HealthStatus`] through the configured thresholds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

use crate::buffer::LogBuffer;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::delivery::DeliveryStats;
use crate::event::unix_millis_now;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::sampler::Sampler;

pub const BUFFER: &str = "buffer";
pub const CIRCUIT_BREAKER: &str = "circuit_breaker";
pub const DELIVERY: &str = "delivery";
pub const SAMPLER: &str = "sampler";

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(rename_all = "lowercase"))]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub score: f64,
    pub detail: String,
}

/// Immutable point-in-time health report.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Weighted score in `[0, 1]`.
    pub score: f64,
    pub components: BTreeMap<String, ComponentHealth>,
    pub alerts: Vec<String>,
    pub uptime: Duration,
    /// Unix millis when the snapshot was taken.
    pub timestamp: u64,
    pub metrics: MetricsSnapshot,
}

impl HealthSnapshot {
    /// Kubernetes readiness: serve traffic while healthy or degraded.
    pub fn is_ready(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }

    /// Kubernetes liveness: the pipeline can still accept events (the buffer is not saturated).
    pub fn is_alive(&self) -> bool {
        self.components.get(BUFFER).map_or(true, |c| c.status != HealthStatus::Unhealthy)
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.get(name)
    }
}

/// Polls the pipeline components it was built from.
#[derive(Debug)]
pub struct HealthAggregator {
    buffer: Arc<LogBuffer>,
    breaker: CircuitBreaker,
    stats: Arc<DeliveryStats>,
    sampler: Arc<Sampler>,
    metrics: Arc<PipelineMetrics>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    started_at: u64,
}

impl HealthAggregator {
    pub fn new(
        buffer: Arc<LogBuffer>,
        breaker: CircuitBreaker,
        stats: Arc<DeliveryStats>,
        sampler: Arc<Sampler>,
        metrics: Arc<PipelineMetrics>,
        config: HealthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at = clock.now_millis();
        Self { buffer, breaker, stats, sampler, metrics, config, clock, started_at }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut alerts = Vec::new();
        let mut components = BTreeMap::new();

        let buffer = self.buffer_health(&mut alerts);
        let breaker = self.breaker_health(&mut alerts);
        let delivery = self.delivery_health(&mut alerts);
        let sampler = self.sampler_health(&mut alerts);

        let w = &self.config.weights;
        let total = w.total();
        let score = if total > 0.0 {
            (w.buffer * buffer.score
                + w.circuit_breaker * breaker.score
                + w.delivery * delivery.score
                + w.sampler * sampler.score)
                / total
        } else {
            1.0
        }
        .clamp(0.0, 1.0);

        components.insert(BUFFER.to_string(), buffer);
        components.insert(CIRCUIT_BREAKER.to_string(), breaker);
        components.insert(DELIVERY.to_string(), delivery);
        components.insert(SAMPLER.to_string(), sampler);

        let status = if score >= self.config.healthy_threshold {
            HealthStatus::Healthy
        } else if score >= self.config.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        self.metrics.set_health_score(score);
        HealthSnapshot {
            status,
            score,
            components,
            alerts,
            uptime: Duration::from_millis(self.clock.now_millis().saturating_sub(self.started_at)),
            timestamp: unix_millis_now(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn buffer_health(&self, alerts: &mut Vec<String>) -> ComponentHealth {
        let occupancy = self.buffer.occupancy().clamp(0.0, 1.0);
        let status = if occupancy >= self.config.buffer_critical {
            alerts.push(format!("buffer usage critical: {:.0}%", occupancy * 100.0));
            HealthStatus::Unhealthy
        } else if occupancy >= self.config.buffer_warning {
            alerts.push(format!("buffer usage high: {:.0}%", occupancy * 100.0));
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        ComponentHealth {
            status,
            score: 1.0 - occupancy,
            detail: format!(
                "{} buffered, {} dropped",
                self.buffer.len(),
                self.buffer.dropped_events()
            ),
        }
    }

    fn breaker_health(&self, alerts: &mut Vec<String>) -> ComponentHealth {
        let snap = self.breaker.snapshot();
        let (status, score) = match snap.state {
            CircuitState::Closed => (HealthStatus::Healthy, 1.0),
            CircuitState::HalfOpen => (HealthStatus::Degraded, 0.5),
            CircuitState::Open => {
                alerts.push(format!(
                    "circuit breaker open after {} consecutive failures",
                    snap.consecutive_failures
                ));
                (HealthStatus::Unhealthy, 0.0)
            }
        };
        ComponentHealth {
            status,
            score,
            detail: format!("{}, {} consecutive failures", snap.state, snap.consecutive_failures),
        }
    }

    fn delivery_health(&self, alerts: &mut Vec<String>) -> ComponentHealth {
        let rate = self.stats.error_rate();
        let status = if rate >= self.config.error_rate_critical {
            HealthStatus::Unhealthy
        } else if rate >= self.config.error_rate_warning {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        if status != HealthStatus::Healthy {
            alerts.push(format!("high delivery error rate: {:.1}%", rate * 100.0));
        }
        ComponentHealth {
            status,
            score: 1.0 - rate,
            detail: format!("{} failures / {} attempts", self.stats.failures(), self.stats.attempts()),
        }
    }

    fn sampler_health(&self, alerts: &mut Vec<String>) -> ComponentHealth {
        let scale = self.sampler.scale_factor();
        let status = if scale >= 0.5 { HealthStatus::Healthy } else { HealthStatus::Degraded };
        if status != HealthStatus::Healthy {
            alerts.push(format!("sampling scaled to {:.0}% under volume pressure", scale * 100.0));
        }
        ComponentHealth { status, score: scale, detail: format!("scale factor {:.3}", scale) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BufferConfig, SamplingConfig};
    use crate::event::{Level, LogEvent};

    struct Fixture {
        buffer: Arc<LogBuffer>,
        breaker: CircuitBreaker,
        stats: Arc<DeliveryStats>,
        sampler: Arc<Sampler>,
        clock: ManualClock,
        health: HealthAggregator,
    }

    fn fixture() -> Fixture {
        fixture_with(HealthConfig::default())
    }

    fn fixture_with(config: HealthConfig) -> Fixture {
        let clock = ManualClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let buffer = Arc::new(LogBuffer::with_clock(
            BufferConfig { max_size: 10, flush_interval: Duration::from_secs(5) },
            shared.clone(),
        ));
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30)).unwrap().with_clock(shared.clone());
        let stats = Arc::new(DeliveryStats::new(Duration::from_secs(60), shared.clone()));
        let sampler = Arc::new(
            Sampler::new(SamplingConfig { volume_threshold: 10, ..SamplingConfig::default() })
                .with_clock(shared.clone()),
        );
        let health = HealthAggregator::new(
            buffer.clone(),
            breaker.clone(),
            stats.clone(),
            sampler.clone(),
            Arc::new(PipelineMetrics::new()),
            config,
            shared,
        );
        Fixture { buffer, breaker, stats, sampler, clock, health }
    }

    fn ev() -> LogEvent {
        LogEvent::new(Level::Info, "m", "svc", "ns")
    }

    #[test]
    fn idle_pipeline_is_healthy() {
        let f = fixture();
        let snap = f.health.snapshot();
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert_eq!(snap.score, 1.0);
        assert!(snap.alerts.is_empty());
        assert!(snap.is_ready() && snap.is_alive());
        assert_eq!(snap.components.len(), 4);
    }

    #[test]
    fn delivery_cutoffs_follow_config() {
        let f = fixture_with(HealthConfig {
            error_rate_warning: 0.2,
            error_rate_critical: 0.3,
            ..HealthConfig::default()
        });
        for failed in [true, false, false] {
            f.stats.record(failed);
        }
        // 1 of 3 failed: below the default 0.5 cutoff but above the configured one.
        assert_eq!(f.health.snapshot().component(DELIVERY).unwrap().status, HealthStatus::Unhealthy);

        let f = fixture();
        for failed in [true, false, false] {
            f.stats.record(failed);
        }
        assert_eq!(f.health.snapshot().component(DELIVERY).unwrap().status, HealthStatus::Degraded);
    }

    #[test]
    fn open_breaker_degrades_and_alerts() {
        let f = fixture();
        f.breaker.record_failure();
        f.breaker.record_failure();
        f.stats.record(true);
        f.stats.record(true);

        let snap = f.health.snapshot();
        // breaker 0 and delivery 0: 0.3 + 0.1 out of 1.0
        assert!((snap.score - 0.4).abs() < 1e-9);
        assert_eq!(snap.status, HealthStatus::Unhealthy);
        assert!(!snap.is_ready());
        assert!(snap.is_alive());
        assert!(snap.alerts.iter().any(|a| a.contains("circuit breaker open")));
        assert!(snap.alerts.iter().any(|a| a.contains("error rate")));
    }

    #[test]
    fn buffer_pressure_raises_alerts() {
        let f = fixture();
        for _ in 0..8 {
            f.buffer.enqueue(ev());
        }
        let snap = f.health.snapshot();
        assert_eq!(snap.component(BUFFER).unwrap().status, HealthStatus::Degraded);

        f.buffer.enqueue(ev());
        f.buffer.enqueue(ev());
        let snap = f.health.snapshot();
        assert_eq!(snap.component(BUFFER).unwrap().status, HealthStatus::Unhealthy);
        assert!(!snap.is_alive());
    }

    #[test]
    fn snapshot_does_not_mutate_components() {
        let f = fixture();
        f.breaker.record_failure();
        f.breaker.record_failure();
        f.clock.advance(31_000);
        for _ in 0..3 {
            f.buffer.enqueue(ev());
        }

        let _ = f.health.snapshot();
        let _ = f.health.snapshot();

        assert_eq!(f.breaker.state(), CircuitState::Open, "no half-open trial claimed");
        assert_eq!(f.buffer.len(), 3);
        assert_eq!(f.sampler.statistics().observed, 0);
        assert_eq!(f.health.snapshot().uptime, Duration::from_secs(31));
    }

    #[test]
    fn sampler_volume_pressure_is_reported() {
        let f = fixture();
        for _ in 0..100 {
            f.sampler.decide(&ev());
        }
        let snap = f.health.snapshot();
        assert_eq!(snap.component(SAMPLER).unwrap().status, HealthStatus::Degraded);
        assert!((snap.component(SAMPLER).unwrap().score - 0.1).abs() < 1e-9);
    }
}
