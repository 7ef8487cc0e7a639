//! Circuit breaker gating batch delivery, implemented with lock-free atomics.
//!
//! `Closed` → (`consecutive_failures >= failure_threshold`) → `Open` → (cooldown elapsed, next
//! [`CircuitBreaker::allow`]) → `HalfOpen` with exactly one trial in flight. The trial's outcome
//! either closes the breaker (failures reset to 0) or reopens it with a fresh cooldown.
//!
//! Clones share the same underlying state via `Arc`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::config::CircuitBreakerConfig;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Rejects attempts until the cooldown elapses.
    Open,
    /// One trial attempt is allowed to probe recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold { provided: u32 },
    /// Cooldown must be > 0.
    InvalidCooldown(Duration),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidCooldown(cooldown) => {
                write!(f, "cooldown_period must be > 0 (got {:?})", cooldown)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// A state change caused by an `allow`/`record_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
}

/// Result of asking the breaker for permission to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead. Carries the Open → HalfOpen transition when this call claimed the trial.
    Allowed { transition: Option<CircuitTransition> },
    /// Fast-fail without touching the sink.
    Rejected { open_for: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition_millis: u64,
    /// Time since the breaker last opened, when Open or HalfOpen.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    failures: AtomicU64,
    last_transition_millis: AtomicU64,
    trial_in_flight: AtomicBool,
}

/// Lock-free circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    failure_threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker, validating its thresholds.
    ///
    /// # Examples
    /// ```
    /// use logrelay::CircuitBreaker;
    /// use std::time::Duration;
    /// let breaker = CircuitBreaker::new(5, Duration::from_secs(30)).unwrap();
    /// assert!(breaker.allow());
    /// ```
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if cooldown.is_zero() {
            return Err(CircuitBreakerError::InvalidCooldown(cooldown));
        }
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Ok(Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failures: AtomicU64::new(0),
                last_transition_millis: AtomicU64::new(clock.now_millis()),
                trial_in_flight: AtomicBool::new(false),
            }),
            failure_threshold,
            cooldown,
            clock,
        })
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        Self::new(config.failure_threshold, config.cooldown_period)
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.state.last_transition_millis.store(clock.now_millis(), Ordering::Release);
        self.clock = clock;
        self
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        clamp_u32(self.state.failures.load(Ordering::Acquire))
    }

    /// `true` if an attempt may proceed. See [`check`](Self::check) for the transition detail.
    pub fn allow(&self) -> bool {
        self.check().is_allowed()
    }

    /// Ask for permission to send.
    ///
    /// Closed always admits. Open rejects until the cooldown elapses; the first caller after that
    /// moves the breaker to HalfOpen and becomes the single trial. While the trial is in flight
    /// every other caller is rejected.
    pub fn check(&self) -> Admission {
        loop {
            match CircuitState::from_u8(self.state.state.load(Ordering::Acquire)) {
                CircuitState::Closed => return Admission::Allowed { transition: None },
                CircuitState::Open => {
                    let elapsed = self.since_transition();
                    if elapsed < self.cooldown {
                        return Admission::Rejected { open_for: elapsed };
                    }
                    // claim the trial before publishing HalfOpen
                    if self
                        .state
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Admission::Rejected { open_for: elapsed };
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("Circuit breaker → half-open");
                            return Admission::Allowed {
                                transition: Some(CircuitTransition {
                                    from: CircuitState::Open,
                                    to: CircuitState::HalfOpen,
                                    consecutive_failures: self.consecutive_failures(),
                                }),
                            };
                        }
                        // state moved under us (reset); release the claim and re-read
                        Err(_) => {
                            self.state.trial_in_flight.store(false, Ordering::Release);
                            continue;
                        }
                    }
                }
                CircuitState::HalfOpen => {
                    if self
                        .state
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Admission::Allowed { transition: None };
                    }
                    return Admission::Rejected { open_for: self.since_transition() };
                }
            }
        }
    }

    /// Record a successful send. Any success resets the consecutive failure count, so only an
    /// unbroken streak of failures trips the breaker.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failures.store(0, Ordering::Release);
                    self.state.trial_in_flight.store(false, Ordering::Release);
                    self.touch();
                    tracing::info!("Circuit breaker → closed");
                    return Some(CircuitTransition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                        consecutive_failures: 0,
                    });
                }
                None
            }
            CircuitState::Closed => {
                self.state.failures.store(0, Ordering::Release);
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed send.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let failures = clamp_u32(self.state.failures.fetch_add(1, Ordering::AcqRel) + 1);
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.touch();
                    self.state.trial_in_flight.store(false, Ordering::Release);
                    tracing::warn!(failures, "Circuit breaker: trial failed → open");
                    return Some(CircuitTransition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                        consecutive_failures: failures,
                    });
                }
                None
            }
            CircuitState::Closed => {
                if failures >= self.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.touch();
                    tracing::error!(
                        failures,
                        threshold = self.failure_threshold,
                        "Circuit breaker → open"
                    );
                    return Some(CircuitTransition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                        consecutive_failures: failures,
                    });
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Read-only view; never changes state.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state();
        let last_transition_millis = self.state.last_transition_millis.load(Ordering::Acquire);
        let open_for = match state {
            CircuitState::Closed => None,
            _ => Some(self.since_transition()),
        };
        CircuitBreakerSnapshot {
            state,
            consecutive_failures: self.consecutive_failures(),
            last_transition_millis,
            open_for,
        }
    }

    /// Force the breaker back to Closed with a zero failure count.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failures.store(0, Ordering::Release);
        self.state.trial_in_flight.store(false, Ordering::Release);
        self.touch();
    }

    fn touch(&self) {
        self.state.last_transition_millis.store(self.clock.now_millis(), Ordering::Release);
    }

    fn since_transition(&self) -> Duration {
        let at = self.state.last_transition_millis.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(at))
    }
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}
