//! Adaptive, volume-aware sampling.
//!
//! Every observed event (kept or not) is counted into a bucketed sliding window. When a
//! `volume_threshold` is set and the window total exceeds it, every level's base rate is multiplied by
//! `max(volume_threshold / count, min_scale)`. Priority levels bypass the rate entirely when
//! preservation is enabled. A decision is O(1), never blocks, and never fails: a malformed rate
//! keeps everything at that level and is reported once per configuration snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::{Clock, MonotonicClock};
use crate::config::SamplingConfig;
use crate::dynamic::DynamicConfig;
use crate::error::PipelineError;
use crate::event::{Level, LogEvent};
use crate::window::SlidingWindow;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingReason {
    /// Sampling switched off; everything is kept.
    Disabled,
    /// Debug mode keeps everything.
    DebugMode,
    /// ERROR/CRITICAL (and WARNING when configured) always kept.
    PreservedPriority,
    /// Base level rate applied, no volume pressure.
    LevelRate,
    /// Base level rate scaled down by window volume.
    VolumeScaled,
    /// Configured rate was invalid; kept.
    MalformedRate,
}

/// Outcome of one sampling decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDecision {
    pub keep: bool,
    /// Probability that was applied.
    pub rate: f64,
    pub reason: SamplingReason,
}

/// Kept/dropped counts for one level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub kept: u64,
    pub dropped: u64,
}

/// Cumulative sampler statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingStatistics {
    pub observed: u64,
    pub kept: u64,
    pub dropped: u64,
    pub per_level: BTreeMap<Level, LevelCounts>,
    /// Events counted in the current window.
    pub window_count: u64,
    pub scale_factor: f64,
}

#[derive(Debug, Default)]
struct LevelCounters {
    kept: AtomicU64,
    dropped: AtomicU64,
}

/// Per-pipeline sampling state.
#[derive(Debug)]
pub struct Sampler {
    config: DynamicConfig<SamplingConfig>,
    window: ArcSwap<SlidingWindow<1>>,
    clock: Arc<dyn Clock>,
    seeded: Option<Mutex<StdRng>>,
    /// One bit per level already reported as malformed in the current snapshot.
    reported: AtomicU8,
    counters: [LevelCounters; 5],
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let window = SlidingWindow::new(config.window_size, config.window_segments);
        Self {
            config: DynamicConfig::new(config),
            window: ArcSwap::from_pointee(window),
            clock: Arc::new(MonotonicClock::default()),
            seeded: None,
            reported: AtomicU8::new(0),
            counters: Default::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a deterministic RNG (tests and benchmarks).
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.seeded = Some(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    pub fn config(&self) -> Arc<SamplingConfig> {
        self.config.get()
    }

    /// Swap in a new configuration snapshot.
    ///
    /// Window counts survive unless the window geometry changed.
    pub fn reconfigure(&self, config: SamplingConfig) {
        let current = self.window.load();
        if current.window() != config.window_size
            || current.segments() != config.window_segments.max(1) as usize
        {
            self.window
                .store(Arc::new(SlidingWindow::new(config.window_size, config.window_segments)));
        }
        self.reported.store(0, Ordering::Release);
        self.config.set(config);
    }

    /// Keep or drop `event`.
    pub fn decide(&self, event: &LogEvent) -> bool {
        self.decide_detailed(event).keep
    }

    pub fn decide_detailed(&self, event: &LogEvent) -> SamplingDecision {
        let level = event.level();
        let cfg = self.config.get();
        let now = self.clock.now_millis();
        let window = self.window.load();
        window.record(now, 0, 1);

        let decision = match self.rate_for(&cfg, level, || window.total(now, 0)) {
            Ok((rate, reason)) if rate >= 1.0 => SamplingDecision { keep: true, rate: 1.0, reason },
            Ok((rate, reason)) => SamplingDecision { keep: self.draw() < rate, rate, reason },
            Err(rate) => {
                self.report_anomaly(level, rate);
                SamplingDecision { keep: true, rate: 1.0, reason: SamplingReason::MalformedRate }
            }
        };

        let counters = &self.counters[level.index()];
        if decision.keep {
            counters.kept.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// Rate currently applied to `level`. Read-only.
    pub fn effective_rate(&self, level: Level) -> f64 {
        let cfg = self.config.get();
        let now = self.clock.now_millis();
        let window = self.window.load();
        match self.rate_for(&cfg, level, || window.total(now, 0)) {
            Ok((rate, _)) => rate.min(1.0),
            Err(_) => 1.0,
        }
    }

    /// Current volume scale factor in `[min_scale, 1.0]`.
    pub fn scale_factor(&self) -> f64 {
        let cfg = self.config.get();
        let count = self.window.load().total(self.clock.now_millis(), 0);
        scale(&cfg, count)
    }

    /// Clear buckets that have left the window.
    pub fn rotate(&self) -> usize {
        self.window.load().rotate(self.clock.now_millis())
    }

    pub fn statistics(&self) -> SamplingStatistics {
        let mut per_level = BTreeMap::new();
        let (mut kept, mut dropped) = (0, 0);
        for level in Level::ALL {
            let c = &self.counters[level.index()];
            let counts = LevelCounts {
                kept: c.kept.load(Ordering::Relaxed),
                dropped: c.dropped.load(Ordering::Relaxed),
            };
            kept += counts.kept;
            dropped += counts.dropped;
            per_level.insert(level, counts);
        }
        let cfg = self.config.get();
        let window_count = self.window.load().total(self.clock.now_millis(), 0);
        SamplingStatistics {
            observed: kept + dropped,
            kept,
            dropped,
            per_level,
            window_count,
            scale_factor: scale(&cfg, window_count),
        }
    }

    /// `Ok((rate, reason))` for a usable rate, `Err(raw)` for a malformed one.
    fn rate_for(
        &self,
        cfg: &SamplingConfig,
        level: Level,
        window_count: impl FnOnce() -> u64,
    ) -> Result<(f64, SamplingReason), f64> {
        if !cfg.enabled {
            return Ok((1.0, SamplingReason::Disabled));
        }
        if cfg.debug_mode {
            return Ok((1.0, SamplingReason::DebugMode));
        }
        if (cfg.preserve_errors && level.is_error())
            || (cfg.preserve_warnings && level == Level::Warning)
        {
            return Ok((1.0, SamplingReason::PreservedPriority));
        }
        let base = cfg.rate_for(level);
        if !(0.0..=1.0).contains(&base) {
            return Err(base);
        }
        let scale = scale(cfg, window_count());
        if scale < 1.0 {
            Ok((base * scale, SamplingReason::VolumeScaled))
        } else {
            Ok((base, SamplingReason::LevelRate))
        }
    }

    fn report_anomaly(&self, level: Level, rate: f64) {
        let bit = 1u8 << level.index();
        if self.reported.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            let err = PipelineError::SamplingAnomaly { level, rate };
            tracing::warn!(%level, rate, "{}", err);
        }
    }

    fn draw(&self) -> f64 {
        match &self.seeded {
            Some(rng) => rng.lock().unwrap_or_else(PoisonError::into_inner).random::<f64>(),
            None => rand::rng().random::<f64>(),
        }
    }
}

fn scale(cfg: &SamplingConfig, count: u64) -> f64 {
    if cfg.volume_threshold == 0 || count <= cfg.volume_threshold {
        return 1.0;
    }
    let floor = cfg.min_scale.clamp(0.0, 1.0);
    (cfg.volume_threshold as f64 / count as f64).max(floor).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn event(level: Level) -> LogEvent {
        LogEvent::new(level, "m", "svc", "ns")
    }

    fn sampler(cfg: SamplingConfig) -> (Sampler, ManualClock) {
        let clock = ManualClock::new();
        let s = Sampler::new(cfg).with_clock(Arc::new(clock.clone())).with_rng_seed(7);
        (s, clock)
    }

    #[test]
    fn default_config_keeps_everything() {
        let (s, _) = sampler(SamplingConfig::default());
        for _ in 0..500 {
            assert!(s.decide(&event(Level::Debug)));
        }
        assert_eq!(s.statistics().dropped, 0);
    }

    #[test]
    fn default_config_never_scales_under_volume() {
        let (s, _) = sampler(SamplingConfig::default());
        let kept = (0..5_000).filter(|_| s.decide(&event(Level::Info))).count();
        assert_eq!(kept, 5_000);
        assert_eq!(s.scale_factor(), 1.0);
        assert_eq!(s.effective_rate(Level::Info), 1.0);
        assert_eq!(s.statistics().window_count, 5_000);
    }

    #[test]
    fn errors_are_preserved_under_any_volume() {
        let cfg = SamplingConfig {
            default_rate: 0.0,
            volume_threshold: 10,
            ..SamplingConfig::default()
        };
        let (s, _) = sampler(cfg);
        for _ in 0..1_000 {
            s.decide(&event(Level::Info));
        }
        for _ in 0..100 {
            let d = s.decide_detailed(&event(Level::Error));
            assert!(d.keep);
            assert_eq!(d.reason, SamplingReason::PreservedPriority);
            assert!(s.decide(&event(Level::Critical)));
        }
    }

    #[test]
    fn warnings_preserved_only_when_configured() {
        let cfg = SamplingConfig { default_rate: 0.0, ..SamplingConfig::default() };
        let (s, _) = sampler(cfg.clone());
        assert!(!s.decide(&event(Level::Warning)));

        let (s, _) = sampler(SamplingConfig { preserve_warnings: true, ..cfg });
        assert!(s.decide(&event(Level::Warning)));
    }

    #[test]
    fn volume_scales_rates_down() {
        let cfg = SamplingConfig {
            default_rate: 0.1,
            volume_threshold: 1_000,
            window_size: Duration::from_secs(60),
            ..SamplingConfig::default()
        };
        let (s, _) = sampler(cfg);

        let kept = (0..2_000).filter(|_| s.decide(&event(Level::Info))).count();

        assert!((s.scale_factor() - 0.5).abs() < 1e-9);
        assert!((s.effective_rate(Level::Info) - 0.05).abs() < 1e-9);
        // 1000 events at 0.1, then 1000 at 0.1 * 1000/n: about 100 + 69
        assert!((120..=220).contains(&kept), "kept {}", kept);
    }

    #[test]
    fn effective_rate_never_exceeds_base() {
        let cfg = SamplingConfig::recommended();
        let (s, _) = sampler(SamplingConfig { volume_threshold: 50, ..cfg.clone() });
        for i in 0..500 {
            s.decide(&event(Level::ALL[i % 5]));
            for level in [Level::Debug, Level::Info, Level::Warning] {
                assert!(s.effective_rate(level) <= cfg.rate_for(level));
            }
        }
    }

    #[test]
    fn scale_is_floored() {
        let cfg = SamplingConfig { volume_threshold: 1, min_scale: 0.25, ..SamplingConfig::default() };
        let (s, _) = sampler(cfg);
        for _ in 0..100 {
            s.decide(&event(Level::Info));
        }
        assert_eq!(s.scale_factor(), 0.25);
    }

    #[test]
    fn window_expiry_restores_full_rate() {
        let cfg = SamplingConfig { volume_threshold: 10, ..SamplingConfig::default() };
        let (s, clock) = sampler(cfg);
        for _ in 0..100 {
            s.decide(&event(Level::Info));
        }
        assert!(s.scale_factor() < 1.0);

        clock.advance(60_000);
        assert_eq!(s.scale_factor(), 1.0);
        assert_eq!(s.rotate(), 1);
    }

    #[test]
    fn malformed_rate_keeps_and_reports() {
        let cfg = SamplingConfig::default().with_level_rate(Level::Debug, 3.0);
        let (s, _) = sampler(cfg);
        let d = s.decide_detailed(&event(Level::Debug));
        assert!(d.keep);
        assert_eq!(d.reason, SamplingReason::MalformedRate);
        assert_eq!(s.effective_rate(Level::Debug), 1.0);
    }

    #[test]
    fn disabled_and_debug_modes_keep_everything() {
        let (s, _) = sampler(SamplingConfig {
            enabled: false,
            default_rate: 0.0,
            ..SamplingConfig::default()
        });
        assert_eq!(s.decide_detailed(&event(Level::Debug)).reason, SamplingReason::Disabled);

        let (s, _) = sampler(SamplingConfig {
            debug_mode: true,
            default_rate: 0.0,
            ..SamplingConfig::default()
        });
        assert_eq!(s.decide_detailed(&event(Level::Debug)).reason, SamplingReason::DebugMode);
    }

    #[test]
    fn reconfigure_swaps_rates() {
        let (s, _) = sampler(SamplingConfig::default());
        assert_eq!(s.effective_rate(Level::Info), 1.0);
        s.reconfigure(SamplingConfig::default().with_level_rate(Level::Info, 0.0));
        assert!(!s.decide(&event(Level::Info)));
        assert_eq!(s.statistics().per_level[&Level::Info].dropped, 1);
    }
}
