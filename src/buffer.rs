//! Bounded in-memory buffer of sampled events.
//!
//! Enqueue never waits on anything but a short critical section. At capacity the oldest event is
//! dropped and counted. A flush detaches the whole contents into a [`DeliveryBatch`] under the same
//! lock that enqueue takes, so no event is lost or duplicated across the flush boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::config::BufferConfig;
use crate::dynamic::DynamicConfig;
use crate::error::PipelineError;
use crate::event::LogEvent;

/// Ordered events detached by one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryBatch {
    /// Monotonically increasing per buffer; doubles as the batch id in diagnostics.
    pub sequence: u64,
    pub events: Vec<LogEvent>,
    /// Clock millis at detach time.
    pub created_at: u64,
    /// Attempts made so far.
    pub attempt: u32,
    /// Clock millis of the next scheduled attempt, if a retry is pending.
    pub next_retry_at: Option<u64>,
}

impl DeliveryBatch {
    pub fn new(sequence: u64, events: Vec<LogEvent>, created_at: u64) -> Self {
        Self { sequence, events, created_at, attempt: 0, next_retry_at: None }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What happened on one enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// The oldest event was discarded to make room.
    pub dropped_oldest: bool,
    /// A flush condition (size or interval) now holds.
    pub flush_due: bool,
}

#[derive(Debug)]
struct Inner {
    events: VecDeque<LogEvent>,
    last_flush: u64,
}

/// Bounded FIFO buffer with size- and time-triggered flush.
#[derive(Debug)]
pub struct LogBuffer {
    inner: Mutex<Inner>,
    config: DynamicConfig<BufferConfig>,
    clock: Arc<dyn Clock>,
    dropped: AtomicU64,
    next_sequence: AtomicU64,
}

impl LogBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: BufferConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(config.max_size.min(4_096)),
                last_flush: now,
            }),
            config: DynamicConfig::new(config),
            clock,
            dropped: AtomicU64::new(0),
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> Arc<BufferConfig> {
        self.config.get()
    }

    /// Swap in new limits. Shrinking below the current length drops the oldest events.
    pub fn reconfigure(&self, config: BufferConfig) {
        let mut inner = self.lock();
        let excess = inner.events.len().saturating_sub(config.max_size.max(1));
        if excess > 0 {
            inner.events.drain(..excess);
            self.count_dropped(excess as u64);
        }
        self.config.set(config);
    }

    /// Append an event, dropping the oldest one first if the buffer is full.
    pub fn enqueue(&self, event: LogEvent) -> EnqueueOutcome {
        let cfg = self.config.get();
        let max = cfg.max_size.max(1);
        let now = self.clock.now_millis();

        let mut inner = self.lock();
        let mut dropped = 0u64;
        while inner.events.len() >= max {
            inner.events.pop_front();
            dropped += 1;
        }
        inner.events.push_back(event);
        let flush_due = is_due(&inner, max, &cfg, now);
        drop(inner);

        if dropped > 0 {
            self.count_dropped(dropped);
        }
        EnqueueOutcome { dropped_oldest: dropped > 0, flush_due }
    }

    /// Detach the contents if the buffer is full or the flush interval has elapsed.
    ///
    /// An empty buffer whose interval elapsed just restarts the interval.
    pub fn flush_if_due(&self) -> Option<DeliveryBatch> {
        let cfg = self.config.get();
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        if inner.events.is_empty() {
            if now.saturating_sub(inner.last_flush) >= millis(cfg.flush_interval) {
                inner.last_flush = now;
            }
            return None;
        }
        if !is_due(&inner, cfg.max_size.max(1), &cfg, now) {
            return None;
        }
        Some(self.detach(&mut inner, now))
    }

    /// Detach whatever is buffered, due or not.
    pub fn force_flush(&self) -> DeliveryBatch {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        self.detach(&mut inner, now)
    }

    /// Discard all buffered events, counting them as dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.events.len();
        inner.events.clear();
        drop(inner);
        if n > 0 {
            self.count_dropped(n as u64);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Fill ratio in `[0, 1]`.
    pub fn occupancy(&self) -> f64 {
        let max = self.config.get().max_size.max(1);
        self.len() as f64 / max as f64
    }

    /// Events discarded by overflow, shrinking, or [`clear`](Self::clear).
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Time left until the flush interval elapses (zero when already due).
    pub fn time_until_due(&self) -> Duration {
        let interval = self.config.get().flush_interval;
        let elapsed = self.clock.now_millis().saturating_sub(self.lock().last_flush);
        interval.saturating_sub(Duration::from_millis(elapsed))
    }

    fn detach(&self, inner: &mut Inner, now: u64) -> DeliveryBatch {
        let events: Vec<LogEvent> = std::mem::take(&mut inner.events).into();
        inner.last_flush = now;
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        DeliveryBatch::new(sequence, events, now)
    }

    fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        tracing::debug!("{}", PipelineError::BufferOverflow { dropped: n });
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_due(inner: &Inner, max: usize, cfg: &BufferConfig, now: u64) -> bool {
    inner.events.len() >= max || now.saturating_sub(inner.last_flush) >= millis(cfg.flush_interval)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
