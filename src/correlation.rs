//! Correlation ids and lightweight span bookkeeping.
//!
//! A [`CorrelationContext`] is an explicit object, one per pipeline or per caller, so several can
//! coexist in one process. Ids are UUIDv7 and therefore time-ordered. Span records exist for
//! observability only; nothing in sampling, buffering or delivery reads them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use uuid::Uuid;

use crate::clock::{Clock, MonotonicClock};
use crate::event::{CorrelationId, LogEvent};

pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Header names consulted by [`extract_from_headers`], in order of preference.
pub const CORRELATION_HEADERS: [&str; 4] =
    ["X-Correlation-ID", "X-Trace-ID", "Correlation-ID", "X-Request-ID"];

/// One logical operation tracked by a [`CorrelationContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRecord {
    pub correlation_id: CorrelationId,
    pub parent: Option<CorrelationId>,
    pub operation: String,
    /// 32 lowercase hex digits, shared by every span of one trace.
    pub trace_id: String,
    /// 16 lowercase hex digits.
    pub span_id: String,
    /// Clock millis.
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub success: Option<bool>,
}

impl SpanRecord {
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| Duration::from_millis(end.saturating_sub(self.started_at)))
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Parsed W3C `traceparent` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub version: u8,
    pub trace_id: String,
    pub span_id: String,
    pub flags: u8,
}

impl TraceParent {
    pub fn sampled(&self) -> bool {
        self.flags & 0x01 == 0x01
    }
}

#[derive(Debug, Default)]
struct Spans {
    active: HashMap<CorrelationId, SpanRecord>,
    finished: HashMap<CorrelationId, SpanRecord>,
}

/// Generates correlation ids and tracks the spans they name.
#[derive(Debug)]
pub struct CorrelationContext {
    spans: Mutex<Spans>,
    current: ArcSwapOption<CorrelationId>,
    clock: Arc<dyn Clock>,
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { spans: Mutex::new(Spans::default()), current: ArcSwapOption::empty(), clock }
    }

    /// Open a root span and make it current.
    pub fn start(&self, operation: impl Into<String>) -> CorrelationId {
        let uuid = Uuid::now_v7();
        let id = CorrelationId::new(uuid.to_string());
        self.open(id, None, operation.into(), uuid.simple().to_string())
    }

    /// Open a span under `parent`, inheriting its trace id when `parent` is known.
    pub fn start_child(&self, operation: impl Into<String>, parent: &CorrelationId) -> CorrelationId {
        let uuid = Uuid::now_v7();
        let trace_id = self
            .span(parent)
            .map(|p| p.trace_id)
            .unwrap_or_else(|| uuid.simple().to_string());
        self.open(CorrelationId::new(uuid.to_string()), Some(parent.clone()), operation.into(), trace_id)
    }

    /// Continue a trace that arrived over the wire, or start a fresh one.
    ///
    /// An incoming correlation header is reused as the id; an incoming `traceparent` supplies the
    /// trace id and becomes the parent.
    pub fn start_from_headers<K, V>(
        &self,
        operation: impl Into<String>,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> CorrelationId
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let headers: Vec<(K, V)> = headers.into_iter().collect();
        let parent = lookup(&headers, TRACEPARENT_HEADER).and_then(parse_traceparent);
        let custom = CORRELATION_HEADERS
            .iter()
            .find_map(|name| lookup(&headers, name).filter(|v| !v.trim().is_empty()))
            .map(|v| CorrelationId::new(v.trim()));

        match (custom, parent) {
            (None, None) => self.start(operation),
            (custom, parent) => {
                let id = custom.unwrap_or_else(|| CorrelationId::new(Uuid::now_v7().to_string()));
                let trace_id = parent
                    .as_ref()
                    .map(|p| p.trace_id.clone())
                    .unwrap_or_else(|| Uuid::now_v7().simple().to_string());
                let parent_id = parent.map(|p| CorrelationId::new(p.span_id));
                self.open(id, parent_id, operation.into(), trace_id)
            }
        }
    }

    /// Return `event` carrying `id`, plus the span's trace fields when the span is known.
    pub fn attach(&self, event: LogEvent, id: &CorrelationId) -> LogEvent {
        let event = event.with_correlation_id(id.clone());
        match self.span(id) {
            Some(span) => event.with_metadata_defaults([
                ("trace_id", span.trace_id),
                ("span_id", span.span_id),
            ]),
            None => event,
        }
    }

    /// Close the span and record its outcome. Unknown or already-ended ids return `None`.
    pub fn end(&self, id: &CorrelationId, success: bool) -> Option<SpanRecord> {
        let now = self.clock.now_millis();
        let mut spans = self.lock();
        let mut span = spans.active.remove(id)?;
        span.ended_at = Some(now);
        span.success = Some(success);
        spans.finished.insert(id.clone(), span.clone());
        let restore = span.parent.clone().filter(|p| spans.active.contains_key(p));
        drop(spans);

        if self.current().as_ref() == Some(id) {
            self.current.store(restore.map(Arc::new));
        }
        tracing::debug!(
            correlation_id = %id,
            operation = %span.operation,
            success,
            duration_ms = span.duration().map_or(0, |d| d.as_millis() as u64),
            "span finished"
        );
        Some(span)
    }

    /// The active or finished span for `id`.
    pub fn span(&self, id: &CorrelationId) -> Option<SpanRecord> {
        let spans = self.lock();
        spans.active.get(id).or_else(|| spans.finished.get(id)).cloned()
    }

    pub fn current(&self) -> Option<CorrelationId> {
        self.current.load_full().map(|id| (*id).clone())
    }

    pub fn set_current(&self, id: Option<CorrelationId>) {
        self.current.store(id.map(Arc::new));
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished.len()
    }

    /// Forget finished spans that ended more than `max_age` ago. Returns how many were removed.
    pub fn cleanup_finished(&self, max_age: Duration) -> usize {
        let now = self.clock.now_millis();
        let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let mut spans = self.lock();
        let before = spans.finished.len();
        spans
            .finished
            .retain(|_, span| span.ended_at.map_or(true, |end| now.saturating_sub(end) <= max_age));
        before - spans.finished.len()
    }

    /// Write correlation headers for `id`, and `traceparent` when the span is known.
    pub fn inject_into_headers<H>(&self, id: &CorrelationId, headers: &mut H)
    where
        H: Extend<(String, String)>,
    {
        headers.extend([
            (CORRELATION_HEADERS[0].to_string(), id.to_string()),
            (CORRELATION_HEADERS[1].to_string(), id.to_string()),
        ]);
        if let Some(span) = self.span(id) {
            headers.extend([(
                TRACEPARENT_HEADER.to_string(),
                format_traceparent(&span.trace_id, &span.span_id, true),
            )]);
        }
    }

    fn open(
        &self,
        id: CorrelationId,
        parent: Option<CorrelationId>,
        operation: String,
        trace_id: String,
    ) -> CorrelationId {
        let span = SpanRecord {
            correlation_id: id.clone(),
            parent,
            operation,
            trace_id,
            span_id: new_span_id(),
            started_at: self.clock.now_millis(),
            ended_at: None,
            success: None,
        };
        self.lock().active.insert(id.clone(), span);
        self.current.store(Some(Arc::new(id.clone())));
        id
    }

    fn lock(&self) -> MutexGuard<'_, Spans> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Correlation id carried by `headers`: the first non-empty custom correlation header, else the
/// trace id of a valid `traceparent`. Header names match case-insensitively.
pub fn extract_from_headers<K, V>(headers: impl IntoIterator<Item = (K, V)>) -> Option<CorrelationId>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let headers: Vec<(K, V)> = headers.into_iter().collect();
    CORRELATION_HEADERS
        .iter()
        .find_map(|name| lookup(&headers, name).filter(|v| !v.trim().is_empty()))
        .map(|v| CorrelationId::new(v.trim()))
        .or_else(|| {
            lookup(&headers, TRACEPARENT_HEADER)
                .and_then(parse_traceparent)
                .map(|tp| CorrelationId::new(tp.trace_id))
        })
}

/// Parse `version-traceid-spanid-flags`. All-zero trace or span ids are invalid.
pub fn parse_traceparent(value: &str) -> Option<TraceParent> {
    let mut parts = value.trim().split('-');
    let (version, trace_id, span_id, flags) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some()
        || !is_hex(version, 2)
        || !is_hex(trace_id, 32)
        || !is_hex(span_id, 16)
        || !is_hex(flags, 2)
        || is_zero(trace_id)
        || is_zero(span_id)
    {
        return None;
    }
    Some(TraceParent {
        version: u8::from_str_radix(version, 16).ok()?,
        trace_id: trace_id.to_string(),
        span_id: span_id.to_string(),
        flags: u8::from_str_radix(flags, 16).ok()?,
    })
}

/// Version-00 `traceparent`.
///
/// Characters that are not hex digits are dropped from both ids, then each id is left-padded with
/// zeros (or truncated) to its W3C width.
pub fn format_traceparent(trace_id: &str, span_id: &str, sampled: bool) -> String {
    format!(
        "00-{}-{}-{}",
        fit(trace_id, 32),
        fit(span_id, 16),
        if sampled { "01" } else { "00" }
    )
}

fn lookup<'h, K: AsRef<str>, V: AsRef<str>>(headers: &'h [(K, V)], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_ref())
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_zero(s: &str) -> bool {
    s.bytes().all(|b| b == b'0')
}

fn fit(id: &str, width: usize) -> String {
    let hex: String = id
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .take(width)
        .collect();
    format!("{hex:0>width$}")
}

fn new_span_id() -> String {
    let bits = Uuid::new_v4().as_u128() as u64;
    format!("{:016x}", bits.max(1))
}
