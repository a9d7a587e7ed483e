//! The telemetry ingestion endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use argus_bus::{BusMessage, Topic};
use argus_store::{CATALOG_PREFIX_CREDENTIAL, Row};
use argus_types::{Event, EventId, EventPayload, Severity};

use crate::state::{AppState, INGEST_HIGH_WATER};

/// Maximum events accepted per request.
const MAX_BATCH: usize = 1000;
/// Suggested client delay under backpressure, in seconds.
const RETRY_AFTER_S: u64 = 5;

/// One inbound event.
#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    /// Event kind wire name (`metric`, `log`, `span`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Originating service; falls back to the batch-level service.
    #[serde(default)]
    pub service: Option<String>,
    /// Kind-specific body.
    pub data: serde_json::Value,
    /// Event time; receipt time when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The ingest request body.
#[derive(Debug, Deserialize)]
pub struct IngestBatch {
    /// Events to ingest.
    pub events: Vec<IngestEvent>,
    /// Set when the batch comes from an instrumentation SDK.
    #[serde(default)]
    pub sdk: Option<bool>,
    /// Default service name for events without one.
    #[serde(default)]
    pub service: Option<String>,
}

/// One rejected event.
#[derive(Debug, Serialize, PartialEq)]
pub struct IngestRejection {
    /// Index into the submitted batch.
    pub index: usize,
    /// What was wrong.
    pub error: String,
}

/// The ingest response body.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Events accepted and persisted.
    pub accepted: usize,
    /// Per-event failures; empty on full success.
    pub rejected: Vec<IngestRejection>,
}

/// `POST /ingest`
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(batch): Json<IngestBatch>,
) -> Response {
    let tenant = match authenticate(&state, &headers).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    if batch.events.len() > MAX_BATCH {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "detail": format!("batch exceeds {MAX_BATCH} events")
            })),
        )
            .into_response();
    }

    // Push back before parsing anything when the store is saturated.
    if state.store.queue_depth() > INGEST_HIGH_WATER {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", RETRY_AFTER_S.to_string())],
            Json(serde_json::json!({
                "detail": "ingestion backpressure, retry later"
            })),
        )
            .into_response();
    }

    let sdk = batch.sdk.unwrap_or(false);
    let mut accepted_events = Vec::new();
    let mut rejected = Vec::new();
    for (index, raw) in batch.events.into_iter().enumerate() {
        match parse_event(raw, batch.service.as_deref(), &tenant) {
            Ok(event) => accepted_events.push(event),
            Err(error) => rejected.push(IngestRejection { index, error }),
        }
    }

    // Atomic per batch: one append for everything accepted, published
    // only after the store has taken it.
    let rows: Vec<Row> = accepted_events
        .iter()
        .map(|event| Row::from_event(event, sdk))
        .collect();
    if !rows.is_empty() {
        if let Err(e) = state.store.append(rows).await {
            tracing::error!(err = %e, "ingest append failed");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", RETRY_AFTER_S.to_string())],
                Json(serde_json::json!({"detail": "store write failed, retry later"})),
            )
                .into_response();
        }
        for event in accepted_events.iter() {
            state.bus.publish(
                Topic::TelemetryRaw,
                BusMessage::Telemetry(Arc::new(event.clone())),
            );
        }
    }

    Json(IngestResponse {
        accepted: accepted_events.len(),
        rejected,
    })
    .into_response()
}

/// Resolve the tenant from the `x-argus-key` header.
///
/// When credentials are provisioned in the catalog, a valid key is
/// required; with none provisioned the server is open (single-tenant
/// development mode) and the tenant is empty.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let credentials = state
        .store
        .catalog_list(CATALOG_PREFIX_CREDENTIAL)
        .await
        .unwrap_or_default();
    if credentials.is_empty() {
        return Ok(String::new());
    }

    let presented = headers
        .get("x-argus-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let key = format!("{CATALOG_PREFIX_CREDENTIAL}{presented}");
    match credentials.iter().find(|(k, _)| *k == key) {
        Some((_, record)) => Ok(record["tenant"].as_str().unwrap_or("").to_string()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"detail": "missing or invalid API key"})),
        )
            .into_response()),
    }
}

/// Validate one inbound event against its kind schema.
fn parse_event(
    raw: IngestEvent,
    default_service: Option<&str>,
    tenant: &str,
) -> Result<Event, String> {
    let source = raw
        .service
        .as_deref()
        .or(default_service)
        .filter(|s| !s.is_empty())
        .ok_or("missing service")?
        .to_string();

    let mut data = raw.data;
    let object = data
        .as_object_mut()
        .ok_or("data must be an object")?;
    object.insert("type".into(), serde_json::Value::String(raw.kind.clone()));

    let payload: EventPayload = serde_json::from_value(data)
        .map_err(|e| format!("invalid {} payload: {e}", raw.kind))?;

    Ok(Event {
        id: EventId::generate(),
        timestamp: raw.timestamp.unwrap_or_else(Utc::now),
        source,
        tenant: tenant.to_string(),
        payload,
        severity: Severity::Info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::EventKind;
    use serde_json::json;

    fn raw(kind: &str, data: serde_json::Value) -> IngestEvent {
        IngestEvent {
            kind: kind.into(),
            service: Some("s1".into()),
            data,
            timestamp: None,
        }
    }

    #[test]
    fn metric_event_parses() {
        let event = parse_event(
            raw("metric", json!({"name": "cpu", "value": 97})),
            None,
            "",
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::Metric);
        assert_eq!(event.source, "s1");
    }

    #[test]
    fn unknown_kind_rejected() {
        let err = parse_event(raw("telepathy", json!({})), None, "").unwrap_err();
        assert!(err.contains("telepathy"));
    }

    #[test]
    fn missing_required_field_rejected() {
        let err = parse_event(raw("metric", json!({"name": "cpu"})), None, "").unwrap_err();
        assert!(err.contains("metric"));
    }

    #[test]
    fn missing_service_rejected() {
        let event = IngestEvent {
            kind: "metric".into(),
            service: None,
            data: json!({"name": "cpu", "value": 1.0}),
            timestamp: None,
        };
        assert_eq!(parse_event(event, None, "").unwrap_err(), "missing service");
    }

    #[test]
    fn batch_service_fallback_applies() {
        let event = IngestEvent {
            kind: "log".into(),
            service: None,
            data: json!({"message": "hello"}),
            timestamp: None,
        };
        let parsed = parse_event(event, Some("batch-svc"), "t1").unwrap();
        assert_eq!(parsed.source, "batch-svc");
        assert_eq!(parsed.tenant, "t1");
    }

    #[test]
    fn provided_timestamp_is_kept() {
        let ts: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let event = IngestEvent {
            kind: "metric".into(),
            service: Some("s1".into()),
            data: json!({"name": "cpu", "value": 97.0}),
            timestamp: Some(ts),
        };
        assert_eq!(parse_event(event, None, "").unwrap().timestamp, ts);
    }
}
