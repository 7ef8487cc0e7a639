//! Log event records flowing through the pipeline.
//!
//! A [`LogEvent`] is immutable once built: the `with_*` methods consume the value and return a new
//! record, so enrichment never mutates an event another component has already observed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(rename_all = "UPPERCASE"))]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// All levels, lowest severity first.
    pub const ALL: [Level; 5] =
        [Level::Debug, Level::Info, Level::Warning, Level::Error, Level::Critical];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// Dense index used by per-level tables.
    pub(crate) fn index(self) -> usize {
        match self {
            Level::Debug => 0,
            Level::Info => 1,
            Level::Warning => 2,
            Level::Error => 3,
            Level::Critical => 4,
        }
    }

    /// ERROR and CRITICAL.
    pub fn is_error(self) -> bool {
        matches!(self, Level::Error | Level::Critical)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}'")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" | "FATAL" => Ok(Level::Critical),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// Opaque token linking events of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "json", serde(transparent))]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Structured key/value fields attached to an event.
pub type Metadata = BTreeMap<String, String>;

/// A single emitted log record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(Serialize, Deserialize))]
pub struct LogEvent {
    /// Milliseconds since the Unix epoch.
    timestamp: u64,
    level: Level,
    message: String,
    #[cfg_attr(feature = "json", serde(default, skip_serializing_if = "BTreeMap::is_empty"))]
    metadata: Metadata,
    #[cfg_attr(feature = "json", serde(default, skip_serializing_if = "Option::is_none"))]
    correlation_id: Option<CorrelationId>,
    service_name: String,
    namespace: String,
}

impl LogEvent {
    /// Create an event stamped with the current wall-clock time.
    pub fn new(
        level: Level,
        message: impl Into<String>,
        service_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: unix_millis_now(),
            level,
            message: message.into(),
            metadata: Metadata::new(),
            correlation_id: None,
            service_name: service_name.into(),
            namespace: namespace.into(),
        }
    }

    /// Convert a captured error into an ERROR event.
    ///
    /// The error kind, message and cause chain become metadata entries (`error.kind`,
    /// `error.message`, `error.trace`); nothing else about emission changes.
    pub fn from_error(
        error: &CapturedError,
        service_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(Level::Error, error.message.clone(), service_name, namespace)
            .with_metadata("error.kind", error.kind.clone())
            .with_metadata("error.message", error.message.clone());
        if !error.trace.is_empty() {
            event = event.with_metadata("error.trace", error.trace.join("\n"));
        }
        event
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merge fields without overwriting keys already present on the event.
    pub fn with_metadata_defaults<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in fields {
            self.metadata.entry(k.into()).or_insert_with(|| v.into());
        }
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_timestamp(mut self, unix_millis: u64) -> Self {
        self.timestamp = unix_millis;
        self
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// An error flattened into plain data so it can travel as a [`LogEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    pub kind: String,
    pub message: String,
    /// Cause chain, outermost first, excluding the top-level message.
    pub trace: Vec<String>,
}

impl CapturedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into(), trace: Vec::new() }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    /// Capture an error value and walk its `source()` chain.
    pub fn from_error<E>(kind: impl Into<String>, error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self { kind: kind.into(), message: error.to_string(), trace }
    }
}

pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
