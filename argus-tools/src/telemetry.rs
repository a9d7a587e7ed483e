//! Built-in tools over the time-series store and the alert engine.

use std::sync::Arc;

use chrono::{Duration, Utc};
use schemars::JsonSchema;
use serde::Deserialize;

use argus_engine::{AlertEngine, AlertFilter};
use argus_store::{Agg, AggregateSpec, Order, QuerySpec, Row, Store, TelemetryKind};
use argus_types::{AlertId, AlertStatus, DisplayType, Severity};

use crate::{Tool, ToolContext, ToolError};

fn window_minutes(minutes: Option<u32>) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let now = Utc::now();
    (now - Duration::minutes(minutes.unwrap_or(60) as i64), now)
}

fn rows_to_json(rows: &[Row]) -> serde_json::Value {
    serde_json::json!(
        rows.iter()
            .map(|r| {
                serde_json::json!({
                    "timestamp": r.timestamp,
                    "source": r.source,
                    "name": r.name,
                    "value": r.value,
                    "text": r.text,
                    "attrs": r.attrs,
                })
            })
            .collect::<Vec<_>>()
    )
}

fn store_error(e: argus_store::StoreError) -> ToolError {
    ToolError::ExecutionFailed(e.to_string())
}

async fn run_query(
    store: &Store,
    mut spec: QuerySpec,
    ctx: &ToolContext,
) -> Result<serde_json::Value, ToolError> {
    spec.tenant = ctx.tenant.clone();
    let result = store.query(spec).await.map_err(store_error)?;
    Ok(serde_json::json!({
        "rows": rows_to_json(&result.rows),
        "truncated": result.truncated,
    }))
}

/// Arguments shared by the windowed query tools.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct MetricsQueryInput {
    /// Metric name to match exactly (e.g. `cpu.percent`).
    pub name: Option<String>,
    /// Restrict to one host or service.
    pub source: Option<String>,
    /// Look-back window in minutes (default 60).
    pub window_minutes: Option<u32>,
    /// Read SDK-reported metrics instead of host metrics.
    #[serde(default)]
    pub sdk: bool,
    /// Maximum rows to return (default 200).
    pub limit: Option<u32>,
}

/// Query metric samples from the store.
pub struct QueryMetricsTool {
    store: Store,
}

impl QueryMetricsTool {
    /// Build over a store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl Tool for QueryMetricsTool {
    const NAME: &'static str = "query_metrics";
    type Input = MetricsQueryInput;

    fn description(&self) -> &str {
        "Query metric samples over a recent time window, optionally filtered by name and source."
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::MetricsChart
    }

    async fn call(
        &self,
        input: MetricsQueryInput,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let kind = if input.sdk {
            TelemetryKind::SdkMetrics
        } else {
            TelemetryKind::SystemMetrics
        };
        let spec = QuerySpec {
            kind,
            window: window_minutes(input.window_minutes),
            name: input.name,
            source: input.source,
            order: Order::Asc,
            limit: input.limit.unwrap_or(200) as usize,
            ..QuerySpec::default_for(kind)
        };
        run_query(&self.store, spec, ctx).await
    }
}

/// Arguments for `aggregate_metrics`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AggregateMetricsInput {
    /// Metric name to aggregate.
    pub name: String,
    /// Look-back window in minutes (default 60).
    pub window_minutes: Option<u32>,
    /// Bucket width in seconds (default 60).
    pub bucket_s: Option<u32>,
    /// Split buckets per source host.
    #[serde(default)]
    pub by_source: bool,
}

/// Bucketed avg/max/p95 over a metric.
pub struct AggregateMetricsTool {
    store: Store,
}

impl AggregateMetricsTool {
    /// Build over a store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl Tool for AggregateMetricsTool {
    const NAME: &'static str = "aggregate_metrics";
    type Input = AggregateMetricsInput;

    fn description(&self) -> &str {
        "Aggregate a metric into time buckets with avg, max, and p95 per bucket."
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::MetricsChart
    }

    async fn call(
        &self,
        input: AggregateMetricsInput,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let buckets = self
            .store
            .aggregate(AggregateSpec {
                kind: TelemetryKind::SystemMetrics,
                window: window_minutes(input.window_minutes),
                bucket_s: input.bucket_s.unwrap_or(60) as u64,
                name: Some(input.name),
                group_by_source: input.by_source,
                aggs: vec![Agg::Avg, Agg::Max, Agg::P95, Agg::Count],
            })
            .await
            .map_err(store_error)?;
        Ok(serde_json::json!(
            buckets
                .iter()
                .map(|b| {
                    let mut object = serde_json::json!({
                        "bucket": b.bucket,
                        "group": b.group,
                    });
                    for (agg, value) in &b.values {
                        object[format!("{agg:?}").to_lowercase()] = serde_json::json!(value);
                    }
                    object
                })
                .collect::<Vec<_>>()
        ))
    }
}

/// Arguments for `search_logs`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchLogsInput {
    /// Substring to search log lines for.
    pub contains: Option<String>,
    /// Log level to match exactly (`debug|info|warn|error`).
    pub level: Option<String>,
    /// Restrict to one host or service.
    pub source: Option<String>,
    /// Look-back window in minutes (default 60).
    pub window_minutes: Option<u32>,
    /// Maximum rows to return (default 100).
    pub limit: Option<u32>,
}

/// Search indexed log lines.
pub struct SearchLogsTool {
    store: Store,
}

impl SearchLogsTool {
    /// Build over a store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl Tool for SearchLogsTool {
    const NAME: &'static str = "search_logs";
    type Input = SearchLogsInput;

    fn description(&self) -> &str {
        "Search recent log lines by substring, level, and source."
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::LogViewer
    }

    async fn call(
        &self,
        input: SearchLogsInput,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let spec = QuerySpec {
            kind: TelemetryKind::LogIndex,
            window: window_minutes(input.window_minutes),
            name: input.level,
            source: input.source,
            text_contains: input.contains,
            limit: input.limit.unwrap_or(100) as usize,
            ..QuerySpec::default_for(TelemetryKind::LogIndex)
        };
        run_query(&self.store, spec, ctx).await
    }
}

/// Arguments for the span/dependency/deploy listing tools.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WindowedListInput {
    /// Name filter: span operation, dependency target, or event name.
    pub name: Option<String>,
    /// Restrict to one host or service.
    pub source: Option<String>,
    /// Look-back window in minutes (default 60).
    pub window_minutes: Option<u32>,
    /// Maximum rows to return (default 100).
    pub limit: Option<u32>,
}

macro_rules! windowed_list_tool {
    ($tool:ident, $name:literal, $kind:expr, $display:expr, $doc:literal) => {
        #[doc = $doc]
        pub struct $tool {
            store: Store,
        }

        impl $tool {
            /// Build over a store handle.
            pub fn new(store: Store) -> Self {
                Self { store }
            }
        }

        impl Tool for $tool {
            const NAME: &'static str = $name;
            type Input = WindowedListInput;

            fn description(&self) -> &str {
                $doc
            }

            fn display_type(&self) -> DisplayType {
                $display
            }

            async fn call(
                &self,
                input: WindowedListInput,
                ctx: &ToolContext,
            ) -> Result<serde_json::Value, ToolError> {
                let spec = QuerySpec {
                    kind: $kind,
                    window: window_minutes(input.window_minutes),
                    name: input.name,
                    source: input.source,
                    limit: input.limit.unwrap_or(100) as usize,
                    ..QuerySpec::default_for($kind)
                };
                run_query(&self.store, spec, ctx).await
            }
        }
    };
}

windowed_list_tool!(
    GetSpansTool,
    "get_spans",
    TelemetryKind::Spans,
    DisplayType::Table,
    "List recent trace spans with durations and status."
);

windowed_list_tool!(
    GetDependenciesTool,
    "get_dependencies",
    TelemetryKind::DependencyCalls,
    DisplayType::Table,
    "List recent outbound dependency calls with latency and success."
);

windowed_list_tool!(
    GetDeployEventsTool,
    "get_deploy_events",
    TelemetryKind::DeployEvents,
    DisplayType::Table,
    "List recent deployment markers."
);

/// Arguments for `get_processes`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetProcessesInput {
    /// Restrict to one host.
    pub source: Option<String>,
    /// Look-back window in minutes (default 15).
    pub window_minutes: Option<u32>,
    /// Maximum rows to return (default 100).
    pub limit: Option<u32>,
}

/// List recent process snapshots.
pub struct GetProcessesTool {
    store: Store,
}

impl GetProcessesTool {
    /// Build over a store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl Tool for GetProcessesTool {
    const NAME: &'static str = "get_processes";
    type Input = GetProcessesInput;

    fn description(&self) -> &str {
        "List recent process snapshots with CPU and memory usage."
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::ProcessTable
    }

    async fn call(
        &self,
        input: GetProcessesInput,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let spec = QuerySpec {
            kind: TelemetryKind::SdkEvents,
            window: window_minutes(input.window_minutes.or(Some(15))),
            name_prefix: Some("process:".into()),
            source: input.source,
            limit: input.limit.unwrap_or(100) as usize,
            ..QuerySpec::default_for(TelemetryKind::SdkEvents)
        };
        run_query(&self.store, spec, ctx).await
    }
}

/// Arguments for `get_security_findings`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSecurityFindingsInput {
    /// Restrict to one host.
    pub source: Option<String>,
    /// Look-back window in minutes (default 1440).
    pub window_minutes: Option<u32>,
    /// Maximum rows to return (default 100).
    pub limit: Option<u32>,
}

/// List recent security check results.
pub struct GetSecurityFindingsTool {
    store: Store,
}

impl GetSecurityFindingsTool {
    /// Build over a store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl Tool for GetSecurityFindingsTool {
    const NAME: &'static str = "get_security_findings";
    type Input = GetSecurityFindingsInput;

    fn description(&self) -> &str {
        "List recent security check results and their details."
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::Table
    }

    async fn call(
        &self,
        input: GetSecurityFindingsInput,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let spec = QuerySpec {
            kind: TelemetryKind::SdkEvents,
            window: window_minutes(input.window_minutes.or(Some(1440))),
            name_prefix: Some("security:".into()),
            source: input.source,
            limit: input.limit.unwrap_or(100) as usize,
            ..QuerySpec::default_for(TelemetryKind::SdkEvents)
        };
        run_query(&self.store, spec, ctx).await
    }
}

/// Arguments for `list_alerts`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListAlertsInput {
    /// Filter by status (`active|acknowledged|resolved`).
    pub status: Option<String>,
    /// Filter by severity (`notable|urgent`).
    pub severity: Option<String>,
    /// Maximum alerts to return (default 50).
    pub limit: Option<u32>,
}

/// List alerts from the alert engine.
pub struct ListAlertsTool {
    engine: Arc<AlertEngine>,
}

impl ListAlertsTool {
    /// Build over the engine handle.
    pub fn new(engine: Arc<AlertEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for ListAlertsTool {
    const NAME: &'static str = "list_alerts";
    type Input = ListAlertsInput;

    fn description(&self) -> &str {
        "List current and recent alerts, optionally filtered by status and severity."
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::Table
    }

    async fn call(
        &self,
        input: ListAlertsInput,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let status = match input.status.as_deref() {
            None => None,
            Some("active") => Some(AlertStatus::Active),
            Some("acknowledged") => Some(AlertStatus::Acknowledged),
            Some("resolved") => Some(AlertStatus::Resolved),
            Some(other) => {
                return Err(ToolError::InvalidInput(format!("unknown status: {other}")));
            }
        };
        let severity = match input.severity.as_deref() {
            None => None,
            Some("info") => Some(Severity::Info),
            Some("notable") => Some(Severity::Notable),
            Some("urgent") => Some(Severity::Urgent),
            Some(other) => {
                return Err(ToolError::InvalidInput(format!("unknown severity: {other}")));
            }
        };
        let alerts = self
            .engine
            .list_alerts(&AlertFilter {
                status,
                severity,
                page: 0,
                per_page: input.limit.unwrap_or(50) as usize,
            })
            .await;
        serde_json::to_value(alerts).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}

/// Arguments for `get_alert`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetAlertInput {
    /// The alert id.
    pub alert_id: String,
}

/// Fetch one alert with full detail.
pub struct GetAlertTool {
    engine: Arc<AlertEngine>,
}

impl GetAlertTool {
    /// Build over the engine handle.
    pub fn new(engine: Arc<AlertEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for GetAlertTool {
    const NAME: &'static str = "get_alert";
    type Input = GetAlertInput;

    fn description(&self) -> &str {
        "Fetch a single alert by id."
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::JsonTree
    }

    async fn call(
        &self,
        input: GetAlertInput,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let alert = self
            .engine
            .get_alert(&AlertId::new(input.alert_id.clone()))
            .await
            .ok_or_else(|| ToolError::ExecutionFailed(format!("no alert {}", input.alert_id)))?;
        serde_json::to_value(alert).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}
