//! Configuration values consumed by the pipeline.
//!
//! Every struct here is plain data with a `Default`. Loading (files, environment, CLI) is left to
//! the caller; with the `json` feature the structs derive `serde` traits so any loader works.
//! [`PipelineConfig::validate`] collects every problem at once rather than stopping at the first.

use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

use crate::backoff::{Backoff, BackoffError};
use crate::error::ConfigError;
use crate::event::Level;
use crate::jitter::{Jitter, JitterError};

/// Adaptive sampling settings.
///
/// The default keeps everything: `default_rate = 1.0`, no per-level overrides, and no volume
/// scaling until a `volume_threshold` is set.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct SamplingConfig {
    pub enabled: bool,
    /// Keep everything regardless of rates.
    pub debug_mode: bool,
    /// Rate for levels absent from `level_rates`.
    pub default_rate: f64,
    pub level_rates: BTreeMap<Level, f64>,
    /// Events per window above which rates are scaled down. `0` turns volume scaling off.
    pub volume_threshold: u64,
    pub window_size: Duration,
    /// Number of fixed buckets the window is split into.
    pub window_segments: u32,
    /// Floor for the volume scale factor.
    pub min_scale: f64,
    pub preserve_errors: bool,
    pub preserve_warnings: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug_mode: false,
            default_rate: 1.0,
            level_rates: BTreeMap::new(),
            volume_threshold: 0,
            window_size: Duration::from_secs(60),
            window_segments: 6,
            min_scale: 0.01,
            preserve_errors: true,
            preserve_warnings: false,
        }
    }
}

impl SamplingConfig {
    /// Per-level rates suited to a typical service: verbose levels thinned, errors kept.
    pub fn recommended() -> Self {
        Self {
            level_rates: level_table(0.1, 0.5, 0.8),
            volume_threshold: 1_000,
            ..Self::default()
        }
    }

    /// Configured base rate for `level` before volume scaling.
    pub fn rate_for(&self, level: Level) -> f64 {
        self.level_rates.get(&level).copied().unwrap_or(self.default_rate)
    }

    pub fn with_level_rate(mut self, level: Level, rate: f64) -> Self {
        self.level_rates.insert(level, rate);
        self
    }

    fn collect_issues(&self, issues: &mut Vec<String>) {
        // Out-of-range rates are not rejected here; the sampler keeps everything at that level
        // and reports the anomaly once.
        if self.window_size.is_zero() {
            issues.push("sampling.window_size must be > 0".into());
        }
        if self.window_segments == 0 {
            issues.push("sampling.window_segments must be > 0".into());
        }
        if !(self.min_scale > 0.0 && self.min_scale <= 1.0) {
            issues.push(format!("sampling.min_scale must be within (0, 1], got {}", self.min_scale));
        }
    }
}

/// Bounded buffer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct BufferConfig {
    pub max_size: usize,
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { max_size: 10_000, flush_interval: Duration::from_secs(5) }
    }
}

/// Delivery retry settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct RetryConfig {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Cap on the computed delay before jitter.
    pub max_delay: Duration,
    /// Jitter band is `[1 - spread, 1 + spread]`.
    pub jitter_spread: f64,
    /// Upper bound on a single sink call.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_spread: 0.2,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Result<Backoff, BackoffError> {
        Backoff::exponential(self.base_delay)
            .with_multiplier(self.multiplier)?
            .with_max(self.max_delay)
    }

    pub fn jitter(&self) -> Result<Jitter, JitterError> {
        Jitter::proportional(self.jitter_spread)
    }

    fn collect_issues(&self, issues: &mut Vec<String>) {
        if self.max_attempts == 0 {
            issues.push("retry.max_attempts must be > 0".into());
        }
        if self.attempt_timeout.is_zero() {
            issues.push("retry.attempt_timeout must be > 0".into());
        }
        if let Err(e) = self.backoff() {
            issues.push(format!("retry backoff: {}", e));
        }
        if let Err(e) = self.jitter() {
            issues.push(format!("retry jitter: {}", e));
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent Open before a half-open trial is allowed.
    pub cooldown_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_period: Duration::from_secs(30) }
    }
}

/// Relative weight of each component in the health score.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct HealthWeights {
    pub buffer: f64,
    pub circuit_breaker: f64,
    pub delivery: f64,
    pub sampler: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self { buffer: 0.3, circuit_breaker: 0.3, delivery: 0.3, sampler: 0.1 }
    }
}

impl HealthWeights {
    pub fn total(&self) -> f64 {
        self.buffer + self.circuit_breaker + self.delivery + self.sampler
    }
}

/// Health scoring settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct HealthConfig {
    pub weights: HealthWeights,
    /// Minimum score reported as healthy.
    pub healthy_threshold: f64,
    /// Minimum score reported as degraded; anything lower is unhealthy.
    pub degraded_threshold: f64,
    /// Trailing window for the delivery error rate.
    pub error_rate_window: Duration,
    /// Delivery error rate that raises an alert.
    pub error_rate_warning: f64,
    /// Delivery error rate at which delivery is reported unhealthy.
    pub error_rate_critical: f64,
    /// Buffer occupancy that raises a warning.
    pub buffer_warning: f64,
    /// Buffer occupancy treated as critical.
    pub buffer_critical: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            weights: HealthWeights::default(),
            healthy_threshold: 0.8,
            degraded_threshold: 0.5,
            error_rate_window: Duration::from_secs(60),
            error_rate_warning: 0.1,
            error_rate_critical: 0.5,
            buffer_warning: 0.8,
            buffer_critical: 0.95,
        }
    }
}

impl HealthConfig {
    fn collect_issues(&self, issues: &mut Vec<String>) {
        let w = &self.weights;
        if [w.buffer, w.circuit_breaker, w.delivery, w.sampler].iter().any(|v| v.is_nan() || *v < 0.0) {
            issues.push("health weights must be non-negative".into());
        } else if w.total() <= 0.0 {
            issues.push("health weights must not all be zero".into());
        }
        if !(valid_rate(self.degraded_threshold)
            && valid_rate(self.healthy_threshold)
            && self.degraded_threshold <= self.healthy_threshold)
        {
            issues.push(format!(
                "health thresholds must satisfy 0 <= degraded ({}) <= healthy ({}) <= 1",
                self.degraded_threshold, self.healthy_threshold
            ));
        }
        if !(valid_rate(self.buffer_warning)
            && valid_rate(self.buffer_critical)
            && self.buffer_warning <= self.buffer_critical)
        {
            issues.push(format!(
                "buffer alert levels must satisfy 0 <= warning ({}) <= critical ({}) <= 1",
                self.buffer_warning, self.buffer_critical
            ));
        }
        if !(valid_rate(self.error_rate_warning)
            && valid_rate(self.error_rate_critical)
            && self.error_rate_warning <= self.error_rate_critical)
        {
            issues.push(format!(
                "delivery error rate levels must satisfy 0 <= warning ({}) <= critical ({}) <= 1",
                self.error_rate_warning, self.error_rate_critical
            ));
        }
        if self.error_rate_window.is_zero() {
            issues.push("health.error_rate_window must be > 0".into());
        }
    }
}

/// Complete configuration for one [`Pipeline`](crate::Pipeline) instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct PipelineConfig {
    pub service_name: String,
    pub namespace: String,
    pub sampling: SamplingConfig,
    pub buffer: BufferConfig,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    /// Flushed batches waiting for the delivery worker.
    pub queue_capacity: usize,
    /// Upper bound on the final drain at shutdown.
    pub drain_timeout: Duration,
    /// How long finished spans stay queryable before the flush timer forgets them.
    pub span_retention: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".into(),
            namespace: "default".into(),
            sampling: SamplingConfig::default(),
            buffer: BufferConfig::default(),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            queue_capacity: 64,
            drain_timeout: Duration::from_secs(5),
            span_retention: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    pub fn new(service_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), namespace: namespace.into(), ..Self::default() }
    }

    /// Local development: keep every event, flush small batches quickly.
    pub fn development() -> Self {
        Self {
            sampling: SamplingConfig { enabled: false, debug_mode: true, ..SamplingConfig::default() },
            buffer: BufferConfig { max_size: 1_000, flush_interval: Duration::from_secs(1) },
            ..Self::default()
        }
    }

    /// Staging: moderate thinning of verbose levels.
    pub fn staging() -> Self {
        Self {
            sampling: SamplingConfig {
                default_rate: 0.5,
                level_rates: level_table(0.1, 0.3, 0.8),
                volume_threshold: 1_000,
                ..SamplingConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production: aggressive thinning, a large buffer and slower flushes.
    pub fn production() -> Self {
        Self {
            sampling: SamplingConfig {
                default_rate: 0.1,
                level_rates: level_table(0.01, 0.05, 0.5),
                volume_threshold: 5_000,
                ..SamplingConfig::default()
            },
            buffer: BufferConfig { max_size: 50_000, flush_interval: Duration::from_secs(10) },
            ..Self::default()
        }
    }

    /// Select a preset by environment name (`development`, `staging`, `production`).
    pub fn for_environment(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" | "local" => Some(Self::development()),
            "staging" | "stage" => Some(Self::staging()),
            "prod" | "production" => Some(Self::production()),
            _ => None,
        }
    }

    pub fn with_service(mut self, service_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self.namespace = namespace.into();
        self
    }

    /// Check every value, returning all problems found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();
        if self.service_name.trim().is_empty() {
            issues.push("service_name must not be empty".into());
        }
        self.sampling.collect_issues(&mut issues);
        if self.buffer.max_size == 0 {
            issues.push("buffer.max_size must be > 0".into());
        }
        if self.buffer.flush_interval.is_zero() {
            issues.push("buffer.flush_interval must be > 0".into());
        }
        self.retry.collect_issues(&mut issues);
        if self.breaker.failure_threshold == 0 {
            issues.push("breaker.failure_threshold must be > 0".into());
        }
        if self.breaker.cooldown_period.is_zero() {
            issues.push("breaker.cooldown_period must be > 0".into());
        }
        self.health.collect_issues(&mut issues);
        if self.queue_capacity == 0 {
            issues.push("queue_capacity must be > 0".into());
        }
        if self.span_retention.is_zero() {
            issues.push("span_retention must be > 0".into());
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::new(issues))
        }
    }
}

fn valid_rate(rate: f64) -> bool {
    (0.0..=1.0).contains(&rate)
}

fn level_table(debug: f64, info: f64, warning: f64) -> BTreeMap<Level, f64> {
    BTreeMap::from([
        (Level::Debug, debug),
        (Level::Info, info),
        (Level::Warning, warning),
        (Level::Error, 1.0),
        (Level::Critical, 1.0),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(PipelineConfig::development().validate().is_ok());
        assert!(PipelineConfig::staging().validate().is_ok());
        assert!(PipelineConfig::production().validate().is_ok());
    }

    #[test]
    fn default_sampling_keeps_everything() {
        let cfg = SamplingConfig::default();
        for level in Level::ALL {
            assert_eq!(cfg.rate_for(level), 1.0);
        }
        assert_eq!(cfg.volume_threshold, 0);
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn production_preset_values() {
        let cfg = PipelineConfig::production();
        assert_eq!(cfg.sampling.rate_for(Level::Debug), 0.01);
        assert_eq!(cfg.sampling.rate_for(Level::Info), 0.05);
        assert_eq!(cfg.sampling.rate_for(Level::Critical), 1.0);
        assert_eq!(cfg.sampling.volume_threshold, 5_000);
        assert_eq!(cfg.buffer.max_size, 50_000);
        assert_eq!(cfg.buffer.flush_interval, Duration::from_secs(10));
    }

    #[test]
    fn environment_lookup() {
        assert_eq!(PipelineConfig::for_environment("PROD"), Some(PipelineConfig::production()));
        assert!(!PipelineConfig::for_environment("dev").unwrap().sampling.enabled);
        assert_eq!(PipelineConfig::for_environment("qa"), None);
    }

    #[test]
    fn validate_collects_every_issue() {
        let mut cfg = PipelineConfig::default();
        cfg.sampling.min_scale = 0.0;
        cfg.buffer.max_size = 0;
        cfg.breaker.failure_threshold = 0;
        cfg.retry.multiplier = 0.5;
        cfg.health.degraded_threshold = 0.9;

        let err = cfg.validate().unwrap_err();
        assert_eq!(err.issues.len(), 5, "{:?}", err.issues);
        assert!(err.issues.iter().any(|i| i.contains("min_scale")));
        assert!(err.issues.iter().any(|i| i.contains("multiplier")));
    }

    #[test]
    fn error_rate_levels_must_be_ordered() {
        let mut cfg = PipelineConfig::default();
        cfg.health.error_rate_warning = 0.6;
        cfg.health.error_rate_critical = 0.4;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert!(err.issues[0].contains("delivery error rate"));
    }

    #[test]
    fn span_retention_must_be_positive() {
        let mut cfg = PipelineConfig::default();
        cfg.span_retention = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.issues, vec!["span_retention must be > 0".to_string()]);
    }

    #[test]
    fn malformed_rates_are_left_to_the_sampler() {
        let mut cfg = PipelineConfig::default();
        cfg.sampling = cfg.sampling.with_level_rate(Level::Info, 1.5);
        cfg.sampling.default_rate = f64::NAN;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn retry_config_builds_capped_backoff() {
        let backoff = RetryConfig::default().backoff().unwrap();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(20), Duration::from_secs(60));
    }

    #[cfg(feature = "json")]
    #[test]
    fn partial_json_fills_defaults() {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{"service_name":"api","sampling":{"level_rates":{"DEBUG":0.2}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.service_name, "api");
        assert_eq!(cfg.sampling.rate_for(Level::Debug), 0.2);
        assert_eq!(cfg.sampling.rate_for(Level::Info), 1.0);
        assert_eq!(cfg.buffer, BufferConfig::default());
    }
}
