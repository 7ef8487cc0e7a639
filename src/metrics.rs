//! Pipeline counters.
//!
//! Plain relaxed atomics; every counter only grows. [`PipelineMetrics::snapshot`] gives a
//! point-in-time copy for health reports and exporters.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub(crate) ingested: AtomicU64,
    pub(crate) sampled_out: AtomicU64,
    pub(crate) buffered: AtomicU64,
    pub(crate) flushed: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) dropped_overflow: AtomicU64,
    pub(crate) dropped_queue_full: AtomicU64,
    pub(crate) dropped_delivery: AtomicU64,
    pub(crate) dropped_shutdown: AtomicU64,
    pub(crate) circuit_rejections: AtomicU64,
    pub(crate) delivery_attempts: AtomicU64,
    pub(crate) delivery_failures: AtomicU64,
    pub(crate) batches_delivered: AtomicU64,
    pub(crate) batches_exhausted: AtomicU64,
    pub(crate) enrichment_failures: AtomicU64,
    /// f64 bits of the last computed health score.
    health_score: AtomicU64,
}

pub(crate) fn incr(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        metrics.set_health_score(1.0);
        metrics
    }

    pub(crate) fn set_health_score(&self, score: f64) {
        self.health_score.store(score.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            ingested: get(&self.ingested),
            sampled_out: get(&self.sampled_out),
            buffered: get(&self.buffered),
            flushed: get(&self.flushed),
            delivered: get(&self.delivered),
            dropped_overflow: get(&self.dropped_overflow),
            dropped_queue_full: get(&self.dropped_queue_full),
            dropped_delivery: get(&self.dropped_delivery),
            dropped_shutdown: get(&self.dropped_shutdown),
            circuit_rejections: get(&self.circuit_rejections),
            delivery_attempts: get(&self.delivery_attempts),
            delivery_failures: get(&self.delivery_failures),
            batches_delivered: get(&self.batches_delivered),
            batches_exhausted: get(&self.batches_exhausted),
            enrichment_failures: get(&self.enrichment_failures),
            health_score: f64::from_bits(self.health_score.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of every pipeline counter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct MetricsSnapshot {
    pub ingested: u64,
    pub sampled_out: u64,
    pub buffered: u64,
    pub flushed: u64,
    pub delivered: u64,
    pub dropped_overflow: u64,
    pub dropped_queue_full: u64,
    pub dropped_delivery: u64,
    pub dropped_shutdown: u64,
    pub circuit_rejections: u64,
    pub delivery_attempts: u64,
    pub delivery_failures: u64,
    pub batches_delivered: u64,
    pub batches_exhausted: u64,
    pub enrichment_failures: u64,
    pub health_score: f64,
}

impl MetricsSnapshot {
    /// Every dropped event regardless of cause.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_overflow + self.dropped_queue_full + self.dropped_delivery + self.dropped_shutdown
    }

    /// Counter name/value pairs, for exporters.
    pub fn counters(&self) -> [(&'static str, u64); 15] {
        [
            ("ingested", self.ingested),
            ("sampled_out", self.sampled_out),
            ("buffered", self.buffered),
            ("flushed", self.flushed),
            ("delivered", self.delivered),
            ("dropped_overflow", self.dropped_overflow),
            ("dropped_queue_full", self.dropped_queue_full),
            ("dropped_delivery", self.dropped_delivery),
            ("dropped_shutdown", self.dropped_shutdown),
            ("circuit_rejections", self.circuit_rejections),
            ("delivery_attempts", self.delivery_attempts),
            ("delivery_failures", self.delivery_failures),
            ("batches_delivered", self.batches_delivered),
            ("batches_exhausted", self.batches_exhausted),
            ("enrichment_failures", self.enrichment_failures),
        ]
    }
}
