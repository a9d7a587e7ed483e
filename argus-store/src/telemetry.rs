//! Telemetry row model, query/aggregate specs, and retention policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use argus_types::{Event, EventPayload, LogLevel};

/// The seven logical telemetry tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// Host metrics from collectors.
    SystemMetrics,
    /// Indexed log lines.
    LogIndex,
    /// Generic SDK/app events (includes process snapshots and security
    /// findings as prefixed rows).
    SdkEvents,
    /// Trace spans.
    Spans,
    /// Outbound dependency calls.
    DependencyCalls,
    /// Application metrics reported through SDKs.
    SdkMetrics,
    /// Deployment markers.
    DeployEvents,
}

impl TelemetryKind {
    /// All kinds, in table order.
    pub const ALL: [TelemetryKind; 7] = [
        TelemetryKind::SystemMetrics,
        TelemetryKind::LogIndex,
        TelemetryKind::SdkEvents,
        TelemetryKind::Spans,
        TelemetryKind::DependencyCalls,
        TelemetryKind::SdkMetrics,
        TelemetryKind::DeployEvents,
    ];

    /// The SQL table backing this kind.
    pub fn table(&self) -> &'static str {
        match self {
            TelemetryKind::SystemMetrics => "system_metrics",
            TelemetryKind::LogIndex => "log_index",
            TelemetryKind::SdkEvents => "sdk_events",
            TelemetryKind::Spans => "spans",
            TelemetryKind::DependencyCalls => "dependency_calls",
            TelemetryKind::SdkMetrics => "sdk_metrics",
            TelemetryKind::DeployEvents => "deploy_events",
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// One persisted telemetry row. A common shape across the seven tables;
/// the semantic meaning of `name`/`value`/`text` depends on the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Which table the row belongs to.
    pub kind: TelemetryKind,
    /// Tenant scope (empty for host-local telemetry).
    pub tenant: String,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Originating host or service.
    pub source: String,
    /// Metric name, log level, span operation, dependency target, or
    /// prefixed event name.
    pub name: String,
    /// Numeric payload: sample value, duration, latency.
    pub value: Option<f64>,
    /// Textual payload: log line, finding detail.
    pub text: Option<String>,
    /// Kind-specific attributes.
    pub attrs: serde_json::Value,
}

impl Row {
    /// Map an accepted event into its store row.
    ///
    /// `sdk` marks events that arrived through the SDK ingest path, which
    /// routes metrics to `sdk_metrics` instead of `system_metrics`.
    /// Process snapshots and security findings land in `sdk_events` with
    /// a `process:`/`security:` name prefix so they stay queryable
    /// through the seven-table contract.
    pub fn from_event(event: &Event, sdk: bool) -> Row {
        let base = |kind, name: String, value, text, attrs| Row {
            kind,
            tenant: event.tenant.clone(),
            timestamp: event.timestamp,
            source: event.source.clone(),
            name,
            value,
            text,
            attrs,
        };
        match &event.payload {
            EventPayload::Metric { name, value, unit } => {
                let kind = if sdk {
                    TelemetryKind::SdkMetrics
                } else {
                    TelemetryKind::SystemMetrics
                };
                base(
                    kind,
                    name.clone(),
                    Some(*value),
                    None,
                    serde_json::json!({"unit": unit}),
                )
            }
            EventPayload::Log { message, level, path } => base(
                TelemetryKind::LogIndex,
                level_name(*level).to_string(),
                None,
                Some(message.clone()),
                serde_json::json!({"path": path}),
            ),
            EventPayload::Span {
                trace_id,
                span_id,
                name,
                duration_ms,
                ok,
            } => base(
                TelemetryKind::Spans,
                name.clone(),
                Some(*duration_ms),
                None,
                serde_json::json!({"trace_id": trace_id, "span_id": span_id, "ok": ok}),
            ),
            EventPayload::Dependency {
                target,
                protocol,
                latency_ms,
                ok,
            } => base(
                TelemetryKind::DependencyCalls,
                target.clone(),
                Some(*latency_ms),
                None,
                serde_json::json!({"protocol": protocol, "ok": ok}),
            ),
            EventPayload::Process {
                pid,
                name,
                cpu_percent,
                memory_mb,
            } => base(
                TelemetryKind::SdkEvents,
                format!("process:{name}"),
                Some(*cpu_percent),
                None,
                serde_json::json!({"pid": pid, "memory_mb": memory_mb}),
            ),
            EventPayload::SecurityFinding {
                check,
                passed,
                detail,
            } => base(
                TelemetryKind::SdkEvents,
                format!("security:{check}"),
                Some(if *passed { 1.0 } else { 0.0 }),
                Some(detail.clone()),
                serde_json::json!({"passed": passed}),
            ),
            EventPayload::SdkEvent {
                name,
                group,
                attributes,
            } => {
                let kind = if name == "deploy" {
                    TelemetryKind::DeployEvents
                } else {
                    TelemetryKind::SdkEvents
                };
                base(
                    kind,
                    name.clone(),
                    None,
                    None,
                    serde_json::json!({"group": group, "attributes": attributes}),
                )
            }
            EventPayload::AlertDerived {
                alert_id,
                rule_id,
                title,
            } => base(
                TelemetryKind::SdkEvents,
                format!("alert:{rule_id}"),
                None,
                Some(title.clone()),
                serde_json::json!({"alert_id": alert_id}),
            ),
        }
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// Sort order for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

/// A windowed query against one telemetry kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Table to read.
    pub kind: TelemetryKind,
    /// Inclusive start, exclusive end.
    pub window: (DateTime<Utc>, DateTime<Utc>),
    /// Exact `name` match.
    pub name: Option<String>,
    /// `name` prefix match (used for `process:`/`security:` rows).
    pub name_prefix: Option<String>,
    /// Exact source match.
    pub source: Option<String>,
    /// Tenant scope; `None` matches all.
    pub tenant: Option<String>,
    /// Substring match against the text column.
    pub text_contains: Option<String>,
    /// Timestamp ordering.
    pub order: Order,
    /// Result cap; exceeding it sets `truncated`.
    pub limit: usize,
}

impl QuerySpec {
    /// A spec with an open filter over the last hour, capped at 500 rows.
    pub fn default_for(kind: TelemetryKind) -> Self {
        let now = Utc::now();
        Self {
            kind,
            window: (now - Duration::hours(1), now),
            name: None,
            name_prefix: None,
            source: None,
            tenant: None,
            text_contains: None,
            order: Order::Desc,
            limit: 500,
        }
    }
}

/// Query result with a truncation marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching rows, in requested order.
    pub rows: Vec<Row>,
    /// True when more rows matched than `limit` allowed.
    pub truncated: bool,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agg {
    /// Arithmetic mean of `value`.
    Avg,
    /// Minimum `value`.
    Min,
    /// Maximum `value`.
    Max,
    /// Row count.
    Count,
    /// 50th percentile of `value`.
    P50,
    /// 95th percentile of `value`.
    P95,
}

/// A bucketed aggregation over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Table to read.
    pub kind: TelemetryKind,
    /// Inclusive start, exclusive end.
    pub window: (DateTime<Utc>, DateTime<Utc>),
    /// Bucket width in seconds.
    pub bucket_s: u64,
    /// Exact `name` match.
    pub name: Option<String>,
    /// Group buckets by source.
    pub group_by_source: bool,
    /// Aggregates to compute per bucket.
    pub aggs: Vec<Agg>,
}

/// One aggregated bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Bucket start time.
    pub bucket: DateTime<Utc>,
    /// Group key (source), empty when ungrouped.
    pub group: String,
    /// Computed values keyed by aggregate.
    pub values: Vec<(Agg, f64)>,
}

/// Per-kind retention policy for [`crate::Store::purge`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Fallback max age for kinds without an override.
    pub default_max_age: Duration,
    /// Per-kind overrides.
    pub overrides: HashMap<TelemetryKind, Duration>,
}

impl RetentionPolicy {
    /// Same max age for every kind.
    pub fn uniform(max_age: Duration) -> Self {
        Self {
            default_max_age: max_age,
            overrides: HashMap::new(),
        }
    }

    /// The max age for a given kind.
    pub fn max_age(&self, kind: TelemetryKind) -> Duration {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.default_max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::Event;

    #[test]
    fn metric_routes_by_sdk_flag() {
        let event = Event::new(
            "api",
            EventPayload::Metric {
                name: "latency.ms".into(),
                value: 12.5,
                unit: Some("ms".into()),
            },
        );
        assert_eq!(
            Row::from_event(&event, false).kind,
            TelemetryKind::SystemMetrics
        );
        assert_eq!(Row::from_event(&event, true).kind, TelemetryKind::SdkMetrics);
    }

    #[test]
    fn security_finding_gets_prefixed_name() {
        let event = Event::new(
            "web-1",
            EventPayload::SecurityFinding {
                check: "ssh_root_login".into(),
                passed: false,
                detail: "root login enabled".into(),
            },
        );
        let row = Row::from_event(&event, false);
        assert_eq!(row.kind, TelemetryKind::SdkEvents);
        assert_eq!(row.name, "security:ssh_root_login");
        assert_eq!(row.value, Some(0.0));
    }

    #[test]
    fn deploy_sdk_event_routes_to_deploy_table() {
        let event = Event::new(
            "api",
            EventPayload::SdkEvent {
                name: "deploy".into(),
                group: None,
                attributes: Default::default(),
            },
        );
        assert_eq!(
            Row::from_event(&event, true).kind,
            TelemetryKind::DeployEvents
        );
    }

    #[test]
    fn retention_overrides_apply() {
        let mut policy = RetentionPolicy::uniform(Duration::days(7));
        policy
            .overrides
            .insert(TelemetryKind::LogIndex, Duration::days(2));
        assert_eq!(policy.max_age(TelemetryKind::LogIndex), Duration::days(2));
        assert_eq!(policy.max_age(TelemetryKind::Spans), Duration::days(7));
    }
}
