//! Telemetry events: the immutable records flowing through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::id::EventId;

/// The kind of a telemetry event. Determines payload shape, classifier
/// policy, and which store table the event lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A log line from a host or application.
    Log,
    /// A numeric metric sample.
    Metric,
    /// A trace span from an instrumented application.
    Span,
    /// An outbound dependency call (HTTP, database, queue).
    Dependency,
    /// A process snapshot from a host collector.
    Process,
    /// A security check result.
    SecurityFinding,
    /// A custom event reported through an SDK.
    SdkEvent,
    /// An event synthesized from an alert firing.
    AlertDerived,
}

impl EventKind {
    /// All event kinds, in a stable order.
    pub const ALL: [EventKind; 8] = [
        EventKind::Log,
        EventKind::Metric,
        EventKind::Span,
        EventKind::Dependency,
        EventKind::Process,
        EventKind::SecurityFinding,
        EventKind::SdkEvent,
        EventKind::AlertDerived,
    ];

    /// The wire name used in ingestion payloads and persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Log => "log",
            EventKind::Metric => "metric",
            EventKind::Span => "span",
            EventKind::Dependency => "dependency",
            EventKind::Process => "process",
            EventKind::SecurityFinding => "security_finding",
            EventKind::SdkEvent => "sdk_event",
            EventKind::AlertDerived => "alert_derived",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal severity assigned by the classifier.
///
/// `Info < Notable < Urgent`; the alert engine only sees events above
/// `Info`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine; not alert-worthy.
    #[default]
    Info,
    /// Worth surfacing; may match rules.
    Notable,
    /// Requires attention; eligible for auto-investigation.
    Urgent,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Notable => "notable",
            Severity::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

/// Log level carried on log payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug-level detail.
    Debug,
    /// Informational.
    #[default]
    Info,
    /// Something surprising but tolerated.
    Warn,
    /// An operation failed.
    Error,
}

/// Kind-specific event body.
///
/// Explicit tagged union instead of free-form maps: every consumer
/// matches on the variant it understands and ignores nothing silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A log line.
    Log {
        /// The raw log line.
        message: String,
        /// Parsed level, if the collector recognized one.
        #[serde(default)]
        level: LogLevel,
        /// Originating file path, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A numeric sample.
    Metric {
        /// Metric name, e.g. `cpu.percent`.
        name: String,
        /// Sampled value.
        value: f64,
        /// Unit hint, e.g. `percent`, `ms`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// A trace span.
    Span {
        /// Trace this span belongs to.
        trace_id: String,
        /// Span identifier.
        span_id: String,
        /// Operation name.
        name: String,
        /// Wall-clock duration in milliseconds.
        duration_ms: f64,
        /// Whether the span completed without error.
        ok: bool,
    },
    /// An outbound dependency call.
    Dependency {
        /// Target of the call (URL host, database name, queue).
        target: String,
        /// Protocol or driver, e.g. `http`, `postgres`.
        protocol: String,
        /// Call latency in milliseconds.
        latency_ms: f64,
        /// Whether the call succeeded.
        ok: bool,
    },
    /// A process snapshot.
    Process {
        /// Process id.
        pid: u32,
        /// Executable name.
        name: String,
        /// CPU usage in percent.
        cpu_percent: f64,
        /// Resident memory in megabytes.
        memory_mb: f64,
    },
    /// A security check result.
    SecurityFinding {
        /// Name of the check, e.g. `ssh_root_login`.
        check: String,
        /// Whether the check passed.
        passed: bool,
        /// Human detail for the finding.
        detail: String,
    },
    /// A custom SDK-reported event.
    SdkEvent {
        /// Event name, e.g. `exception`, `deploy`, or custom.
        name: String,
        /// Exception grouping key when this is an exception event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        /// Free-form attributes.
        #[serde(default)]
        attributes: BTreeMap<String, serde_json::Value>,
    },
    /// Synthesized when an alert fires, so alerts are queryable as events.
    AlertDerived {
        /// The fired alert.
        alert_id: String,
        /// The rule that fired it.
        rule_id: String,
        /// Alert title.
        title: String,
    },
}

impl EventPayload {
    /// The event kind this payload belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Log { .. } => EventKind::Log,
            EventPayload::Metric { .. } => EventKind::Metric,
            EventPayload::Span { .. } => EventKind::Span,
            EventPayload::Dependency { .. } => EventKind::Dependency,
            EventPayload::Process { .. } => EventKind::Process,
            EventPayload::SecurityFinding { .. } => EventKind::SecurityFinding,
            EventPayload::SdkEvent { .. } => EventKind::SdkEvent,
            EventPayload::AlertDerived { .. } => EventKind::AlertDerived,
        }
    }
}

/// An immutable telemetry event.
///
/// Created on ingest or collector tick, persisted to the store, published
/// on the bus, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier.
    pub id: EventId,
    /// Wall-clock timestamp (UTC; monotonic within a batch).
    pub timestamp: DateTime<Utc>,
    /// Host or service the event originated from.
    pub source: String,
    /// Tenant scope derived from the ingest key; empty for host-local.
    #[serde(default)]
    pub tenant: String,
    /// Kind-specific body.
    pub payload: EventPayload,
    /// Severity assigned by the classifier (`Info` until classified).
    #[serde(default)]
    pub severity: Severity,
}

impl Event {
    /// Build an event with a generated id, stamped `now`.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: EventId::generate(),
            timestamp: Utc::now(),
            source: source.into(),
            tenant: String::new(),
            payload,
            severity: Severity::Info,
        }
    }

    /// The event kind, derived from the payload.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The signal name of this event: the metric name, span operation,
    /// dependency target, check name, SDK event name, or (for logs) the
    /// message text. Rules with a `pattern` match against this.
    pub fn signal(&self) -> &str {
        match &self.payload {
            EventPayload::Metric { name, .. } => name,
            EventPayload::Log { message, .. } => message,
            EventPayload::Span { name, .. } => name,
            EventPayload::Dependency { target, .. } => target,
            EventPayload::Process { name, .. } => name,
            EventPayload::SecurityFinding { check, .. } => check,
            EventPayload::SdkEvent { name, .. } => name,
            EventPayload::AlertDerived { rule_id, .. } => rule_id,
        }
    }

    /// Default deduplication key for this event.
    ///
    /// Collapses repeats of "the same problem" onto one alert. Rules may
    /// override this with their own key function; this is the per-kind
    /// default.
    pub fn dedup_key(&self) -> String {
        match &self.payload {
            EventPayload::Metric { name, .. } => format!("{}:{}", self.source, name),
            EventPayload::Log { .. } => self.source.clone(),
            EventPayload::Span { name, .. } => format!("{}:{}", self.source, name),
            EventPayload::Dependency { target, .. } => format!("{}:{}", self.source, target),
            EventPayload::Process { name, .. } => format!("{}:{}", self.source, name),
            EventPayload::SecurityFinding { check, .. } => format!("{}:{}", self.source, check),
            EventPayload::SdkEvent { name, group, .. } => match group {
                Some(g) => format!("{}:{}:{}", self.source, name, g),
                None => format!("{}:{}", self.source, name),
            },
            EventPayload::AlertDerived { rule_id, .. } => format!("{}:{}", self.source, rule_id),
        }
    }
}
