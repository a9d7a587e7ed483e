//! REST catalog surface consumed by UIs.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;

use argus_agent::RunRecord;
use argus_engine::{AlertError, AlertFilter};
use argus_store::{CATALOG_PREFIX_RUN, Order, QuerySpec, TelemetryKind};
use argus_types::{AlertId, AlertStatus, BudgetSnapshot, CoreError, RuleId, Severity,
    StatusSnapshot};

use crate::state::AppState;

/// REST error wrapper rendering `{detail}` with the taxonomy's status.
pub struct ApiError(pub CoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({"detail": self.0.to_string()}));
        match self.0.retry_after() {
            Some(seconds) => (status, [("Retry-After", seconds.to_string())], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}

impl From<AlertError> for ApiError {
    fn from(e: AlertError) -> Self {
        ApiError(match e {
            AlertError::NotFound(what) => CoreError::NotFound(what),
            AlertError::Conflict(what) => CoreError::Conflict(what),
            AlertError::Store(e) => {
                tracing::error!(err = %e, "catalog write failed");
                CoreError::internal()
            }
            _ => CoreError::internal(),
        })
    }
}

fn parse_status(raw: &str) -> Result<AlertStatus, ApiError> {
    match raw {
        "active" => Ok(AlertStatus::Active),
        "acknowledged" => Ok(AlertStatus::Acknowledged),
        "resolved" => Ok(AlertStatus::Resolved),
        other => Err(ApiError(CoreError::Validation(format!(
            "unknown status: {other}"
        )))),
    }
}

fn parse_severity(raw: &str) -> Result<Severity, ApiError> {
    match raw {
        "info" => Ok(Severity::Info),
        "notable" => Ok(Severity::Notable),
        "urgent" => Ok(Severity::Urgent),
        other => Err(ApiError(CoreError::Validation(format!(
            "unknown severity: {other}"
        )))),
    }
}

/// Query parameters for `GET /alerts`.
#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    /// Filter by status name.
    pub status: Option<String>,
    /// Filter by severity name.
    pub severity: Option<String>,
    /// Zero-based page.
    #[serde(default)]
    pub page: usize,
}

/// `GET /alerts`
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Result<Response, ApiError> {
    let filter = AlertFilter {
        status: query.status.as_deref().map(parse_status).transpose()?,
        severity: query.severity.as_deref().map(parse_severity).transpose()?,
        page: query.page,
        per_page: 0,
    };
    let alerts = state.alerts.list_alerts(&filter).await;
    Ok(Json(alerts).into_response())
}

/// Operator identity carried on lifecycle transitions.
#[derive(Debug, Deserialize, Default)]
pub struct OperatorBody {
    /// Who is acting; defaults to `operator`.
    #[serde(default)]
    pub operator: Option<String>,
}

/// `POST /alerts/:id/acknowledge`
pub async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<OperatorBody>>,
) -> Result<Response, ApiError> {
    let operator = body
        .and_then(|Json(b)| b.operator)
        .unwrap_or_else(|| "operator".into());
    let alert = state
        .alerts
        .acknowledge(&AlertId::new(id), &operator)
        .await?;
    Ok(Json(alert).into_response())
}

/// `POST /alerts/:id/resolve`
pub async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<OperatorBody>>,
) -> Result<Response, ApiError> {
    let operator = body
        .and_then(|Json(b)| b.operator)
        .unwrap_or_else(|| "operator".into());
    let alert = state.alerts.resolve(&AlertId::new(id), &operator).await?;
    Ok(Json(alert).into_response())
}

/// `GET /rules`
pub async fn list_rules(State(state): State<Arc<AppState>>) -> Response {
    Json(state.alerts.list_rules().await).into_response()
}

/// Body for `POST /rules/:id/mute`.
#[derive(Debug, Deserialize)]
pub struct MuteBody {
    /// How long to mute for.
    pub duration_hours: u32,
}

/// `POST /rules/:id/mute`
pub async fn mute_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MuteBody>,
) -> Result<Response, ApiError> {
    if body.duration_hours == 0 {
        return Err(ApiError(CoreError::Validation(
            "duration_hours must be positive".into(),
        )));
    }
    let expiry = state
        .alerts
        .mute(
            &RuleId::new(id),
            ChronoDuration::hours(body.duration_hours as i64),
            "operator",
        )
        .await?;
    Ok(Json(serde_json::json!({"muted_until": expiry})).into_response())
}

/// `POST /rules/:id/unmute`
pub async fn unmute_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.alerts.unmute(&RuleId::new(id), "operator").await?;
    Ok(Json(serde_json::json!({"muted_until": null})).into_response())
}

/// Query parameters for `GET /investigations`.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    /// Zero-based page.
    #[serde(default)]
    pub page: usize,
}

/// `GET /investigations`
pub async fn list_investigations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Response, ApiError> {
    const PER_PAGE: usize = 20;
    let records = state
        .store
        .catalog_list(CATALOG_PREFIX_RUN)
        .await
        .map_err(|e| {
            tracing::error!(err = %e, "run listing failed");
            ApiError(CoreError::internal())
        })?;

    let mut investigations: Vec<RunRecord> = records
        .into_iter()
        .filter_map(|(_, value)| serde_json::from_value::<RunRecord>(value).ok())
        .filter(|record| {
            matches!(
                record.initiator,
                argus_agent::RunInitiator::AutoInvestigation { .. }
            )
        })
        .collect();
    investigations.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    let page: Vec<RunRecord> = investigations
        .into_iter()
        .skip(query.page * PER_PAGE)
        .take(PER_PAGE)
        .collect();
    Ok(Json(page).into_response())
}

/// `GET /budget`
pub async fn get_budget(State(state): State<Arc<AppState>>) -> Json<BudgetSnapshot> {
    Json(state.budget.snapshot())
}

/// Query parameters for `GET /logs`.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Log level name to match.
    pub severity: Option<String>,
    /// Max rows (default 100).
    pub limit: Option<usize>,
}

/// `GET /logs`
pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let now = Utc::now();
    let result = state
        .store
        .query(QuerySpec {
            kind: TelemetryKind::LogIndex,
            window: (now - ChronoDuration::hours(24), now),
            name: query.severity,
            order: Order::Desc,
            limit: query.limit.unwrap_or(100),
            ..QuerySpec::default_for(TelemetryKind::LogIndex)
        })
        .await
        .map_err(|e| {
            tracing::error!(err = %e, "log query failed");
            ApiError(CoreError::internal())
        })?;
    Ok(Json(serde_json::json!({
        "rows": result.rows,
        "truncated": result.truncated,
    }))
    .into_response())
}

/// `GET /security`
pub async fn get_security(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let now = Utc::now();
    let result = state
        .store
        .query(QuerySpec {
            kind: TelemetryKind::SdkEvents,
            window: (now - ChronoDuration::hours(24), now),
            name_prefix: Some("security:".into()),
            order: Order::Desc,
            limit: 200,
            ..QuerySpec::default_for(TelemetryKind::SdkEvents)
        })
        .await
        .map_err(|e| {
            tracing::error!(err = %e, "security query failed");
            ApiError(CoreError::internal())
        })?;
    Ok(Json(serde_json::json!({
        "rows": result.rows,
        "truncated": result.truncated,
    }))
    .into_response())
}

/// Build the current status snapshot.
pub async fn snapshot(state: &AppState) -> StatusSnapshot {
    StatusSnapshot {
        uptime_s: state.started_at.elapsed().as_secs(),
        connections: state.connections.len(),
        active_alerts: state.alerts.active_count().await,
        active_runs: state.runs.active_count(),
        store_queue_depth: state.store.queue_depth(),
        budget: state.budget.snapshot(),
    }
}

/// `GET /status`
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(snapshot(&state).await)
}

/// `GET /settings`
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Response {
    Json(state.config.redacted_view()).into_response()
}
