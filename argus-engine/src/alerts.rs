//! The alert engine: rule matching, dedup, cooldown, mute, lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use argus_bus::{Bus, BusMessage, Subscription, Topic};
use argus_store::{AuditEntry, CATALOG_PREFIX_ALERT, CATALOG_PREFIX_RULE, Row, Store};
use argus_types::{
    Alert, AlertId, AlertRule, AlertStatus, Event, EventPayload, RuleId, RunId, Severity,
};

use crate::notify::NotifierRegistry;
use crate::seed::default_rules;

/// Per-rule override for the dedup key derivation.
pub type DedupKeyFn = Arc<dyn Fn(&Event) -> String + Send + Sync>;

/// Alert engine errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AlertError {
    /// The referenced alert or rule does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested lifecycle transition is forbidden.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The catalog write behind a transition failed.
    #[error("store error: {0}")]
    Store(#[from] argus_store::StoreError),
}

/// Listing filter for `GET /alerts`.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    /// Only alerts in this status.
    pub status: Option<AlertStatus>,
    /// Only alerts at this severity.
    pub severity: Option<Severity>,
    /// Zero-based page.
    pub page: usize,
    /// Page size; defaults to 50 when zero.
    pub per_page: usize,
}

struct EngineState {
    rules: HashMap<RuleId, AlertRule>,
    alerts: HashMap<AlertId, Alert>,
    /// Open alert occupying each (rule, dedup key) slot.
    active: HashMap<(RuleId, String), AlertId>,
    key_fns: HashMap<RuleId, DedupKeyFn>,
}

/// Owns all in-flight alert records. Everything else sees alerts by copy
/// through the bus or the catalog.
pub struct AlertEngine {
    state: Mutex<EngineState>,
    store: Store,
    bus: Bus,
    notifiers: NotifierRegistry,
    investigate_tx: Option<mpsc::Sender<Arc<Alert>>>,
}

impl AlertEngine {
    /// Create an engine. `investigate_tx` receives urgent firings of
    /// auto-investigate rules; pass `None` to disable auto-investigation.
    pub fn new(
        store: Store,
        bus: Bus,
        notifiers: NotifierRegistry,
        investigate_tx: Option<mpsc::Sender<Arc<Alert>>>,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState {
                rules: HashMap::new(),
                alerts: HashMap::new(),
                active: HashMap::new(),
                key_fns: HashMap::new(),
            }),
            store,
            bus,
            notifiers,
            investigate_tx,
        }
    }

    /// Load rules and open alerts from the catalog; seed the default rule
    /// set for any rule id not present yet (existing rules untouched).
    pub async fn load_or_seed(&self) -> Result<(), AlertError> {
        let mut state = self.state.lock().await;

        for (_, value) in self.store.catalog_list(CATALOG_PREFIX_RULE).await? {
            match serde_json::from_value::<AlertRule>(value) {
                Ok(rule) => {
                    state.rules.insert(rule.id.clone(), rule);
                }
                Err(e) => tracing::warn!(err = %e, "skipping unreadable rule record"),
            }
        }
        for rule in default_rules() {
            if !state.rules.contains_key(&rule.id) {
                let value = serde_json::to_value(&rule)
                    .map_err(|e| argus_store::StoreError::Serialization(e.to_string()))?;
                self.store.catalog_put(rule_key(&rule.id), value).await?;
                state.rules.insert(rule.id.clone(), rule);
            }
        }

        for (_, value) in self.store.catalog_list(CATALOG_PREFIX_ALERT).await? {
            match serde_json::from_value::<Alert>(value) {
                Ok(alert) => {
                    if alert.is_open() {
                        state
                            .active
                            .insert((alert.rule_id.clone(), alert.dedup_key.clone()), alert.id.clone());
                    }
                    state.alerts.insert(alert.id.clone(), alert);
                }
                Err(e) => tracing::warn!(err = %e, "skipping unreadable alert record"),
            }
        }

        tracing::info!(
            rules = state.rules.len(),
            alerts = state.alerts.len(),
            "alert engine loaded"
        );
        Ok(())
    }

    /// Install a per-rule dedup key override.
    pub async fn set_key_fn(&self, rule_id: RuleId, key_fn: DedupKeyFn) {
        self.state.lock().await.key_fns.insert(rule_id, key_fn);
    }

    /// Consume classified events until cancelled.
    pub async fn run(self: Arc<Self>, mut sub: Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = sub.recv() => match message {
                    Some(BusMessage::Classified(event)) => {
                        if let Err(e) = self.handle_event(&event).await {
                            tracing::error!(err = %e, "alert engine failed to handle event");
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        tracing::debug!("alert engine stopped");
    }

    /// Evaluate one classified event against all rules. Every matching
    /// rule fires independently; one event may produce several alerts.
    pub async fn handle_event(&self, event: &Event) -> Result<(), AlertError> {
        if event.severity <= Severity::Info {
            return Ok(());
        }
        let now = Utc::now();

        // Collect fire decisions under the lock, run IO after.
        let mut to_fire: Vec<Alert> = Vec::new();
        let mut unmuted: Vec<AlertRule> = Vec::new();
        {
            let mut state = self.state.lock().await;
            let matching: Vec<RuleId> = state
                .rules
                .values()
                .filter(|rule| rule.matches(event))
                .map(|rule| rule.id.clone())
                .collect();

            for rule_id in matching {
                // Lazy unmute: clear expired windows on the first match after expiry.
                let Some(rule) = state.rules.get_mut(&rule_id) else {
                    continue;
                };
                if let Some(until) = rule.mute_until {
                    if now < until {
                        continue;
                    }
                    rule.unmute();
                    unmuted.push(rule.clone());
                }
                let rule = rule.clone();

                let dedup_key = match state.key_fns.get(&rule_id) {
                    Some(key_fn) => key_fn(event),
                    None => event.dedup_key(),
                };
                let slot = (rule_id.clone(), dedup_key.clone());
                if let Some(existing_id) = state.active.get(&slot) {
                    let existing = state.alerts.get(existing_id);
                    if let Some(existing) = existing {
                        if existing.is_open() && now - existing.timestamp < rule.cooldown() {
                            continue; // suppressed by cooldown
                        }
                    }
                }

                let alert = Alert {
                    id: AlertId::generate(),
                    rule_id: rule.id.clone(),
                    severity: event.severity,
                    title: rule.name.clone(),
                    summary: summarize(event),
                    source: event.source.clone(),
                    timestamp: now,
                    status: AlertStatus::Active,
                    dedup_key: dedup_key.clone(),
                    resolved_at: None,
                    acknowledged_at: None,
                    acknowledged_by: None,
                    investigation_id: None,
                };
                state.active.insert(slot, alert.id.clone());
                state.alerts.insert(alert.id.clone(), alert.clone());
                to_fire.push(alert);
            }
        }

        for rule in unmuted {
            self.persist_rule(&rule).await?;
        }
        for alert in to_fire {
            self.fire(alert).await?;
        }
        Ok(())
    }

    async fn fire(&self, alert: Alert) -> Result<(), AlertError> {
        self.persist_alert(&alert).await?;
        self.store
            .audit(AuditEntry {
                actor: "system".into(),
                action: "alert_fired".into(),
                entity: alert_key(&alert.id),
                detail: format!("{} ({})", alert.title, alert.source),
            })
            .await?;

        let shared = Arc::new(alert.clone());
        self.bus
            .publish(Topic::AlertsFired, BusMessage::AlertFired(Arc::clone(&shared)));

        // Alerts are queryable back out of the store as derived events.
        let derived = Event::new(
            alert.source.clone(),
            EventPayload::AlertDerived {
                alert_id: alert.id.to_string(),
                rule_id: alert.rule_id.to_string(),
                title: alert.title.clone(),
            },
        );
        if let Err(e) = self.store.append(vec![Row::from_event(&derived, false)]).await {
            tracing::warn!(err = %e, "failed to persist alert-derived event");
        }
        self.bus
            .publish(Topic::TelemetryRaw, BusMessage::Telemetry(Arc::new(derived)));

        let channels = {
            let state = self.state.lock().await;
            state
                .rules
                .get(&alert.rule_id)
                .map(|r| r.channels.clone())
                .unwrap_or_default()
        };
        self.notifiers.dispatch(&channels, &alert).await;

        let wants_investigation = {
            let state = self.state.lock().await;
            state
                .rules
                .get(&alert.rule_id)
                .is_some_and(|r| r.auto_investigate)
                && alert.severity == Severity::Urgent
        };
        if wants_investigation {
            if let Some(tx) = &self.investigate_tx {
                if tx.try_send(Arc::clone(&shared)).is_err() {
                    tracing::warn!(alert_id = %alert.id, "investigation queue full, skipping");
                }
            }
        }
        Ok(())
    }

    /// Acknowledge an alert. Only valid from `Active`; acknowledging an
    /// already-acknowledged alert is a no-op with the same observable
    /// result. Records the operator identity.
    pub async fn acknowledge(&self, id: &AlertId, by: &str) -> Result<Alert, AlertError> {
        let (alert, transitioned) = {
            let mut state = self.state.lock().await;
            let alert = state
                .alerts
                .get_mut(id)
                .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
            match alert.status {
                AlertStatus::Active => {
                    alert.status = AlertStatus::Acknowledged;
                    alert.acknowledged_at = Some(Utc::now());
                    alert.acknowledged_by = Some(by.to_string());
                    (alert.clone(), true)
                }
                AlertStatus::Acknowledged => (alert.clone(), false),
                AlertStatus::Resolved => {
                    return Err(AlertError::Conflict(format!(
                        "alert {id} is resolved; acknowledge is forbidden"
                    )));
                }
            }
        };
        if transitioned {
            self.persist_alert(&alert).await?;
            self.store
                .audit(AuditEntry {
                    actor: by.to_string(),
                    action: "alert_acknowledged".into(),
                    entity: alert_key(&alert.id),
                    detail: String::new(),
                })
                .await?;
            self.publish_state(&alert, Some(by.to_string()));
        }
        Ok(alert)
    }

    /// Resolve an alert from `Active` or `Acknowledged`. Resolving an
    /// already-resolved alert is a no-op. Frees the (rule, dedup key)
    /// slot; any in-flight auto-investigation is cancelled by its
    /// orchestrator observing the state change.
    pub async fn resolve(&self, id: &AlertId, by: &str) -> Result<Alert, AlertError> {
        let (alert, transitioned) = {
            let mut state = self.state.lock().await;
            let alert = state
                .alerts
                .get_mut(id)
                .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
            match alert.status {
                AlertStatus::Active | AlertStatus::Acknowledged => {
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_at = Some(Utc::now());
                    let cloned = alert.clone();
                    let slot = (cloned.rule_id.clone(), cloned.dedup_key.clone());
                    if state.active.get(&slot) == Some(&cloned.id) {
                        state.active.remove(&slot);
                    }
                    (cloned, true)
                }
                AlertStatus::Resolved => (alert.clone(), false),
            }
        };
        if transitioned {
            self.persist_alert(&alert).await?;
            self.store
                .audit(AuditEntry {
                    actor: by.to_string(),
                    action: "alert_resolved".into(),
                    entity: alert_key(&alert.id),
                    detail: String::new(),
                })
                .await?;
            self.publish_state(&alert, Some(by.to_string()));
        }
        Ok(alert)
    }

    /// Attach a started investigation to its alert.
    pub async fn set_investigation(&self, id: &AlertId, run_id: RunId) -> Result<(), AlertError> {
        let alert = {
            let mut state = self.state.lock().await;
            let alert = state
                .alerts
                .get_mut(id)
                .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
            alert.investigation_id = Some(run_id);
            alert.clone()
        };
        self.persist_alert(&alert).await
    }

    /// Mute a rule for `duration`; returns the new expiry
    /// (`max(now + duration, previous expiry)`).
    pub async fn mute(
        &self,
        rule_id: &RuleId,
        duration: Duration,
        by: &str,
    ) -> Result<chrono::DateTime<Utc>, AlertError> {
        let (rule, expiry) = {
            let mut state = self.state.lock().await;
            let rule = state
                .rules
                .get_mut(rule_id)
                .ok_or_else(|| AlertError::NotFound(rule_id.to_string()))?;
            let expiry = rule.mute(Utc::now(), duration);
            (rule.clone(), expiry)
        };
        self.persist_rule(&rule).await?;
        self.store
            .audit(AuditEntry {
                actor: by.to_string(),
                action: "rule_muted".into(),
                entity: rule_key(rule_id),
                detail: format!("until {expiry}"),
            })
            .await?;
        Ok(expiry)
    }

    /// Clear a rule's mute.
    pub async fn unmute(&self, rule_id: &RuleId, by: &str) -> Result<(), AlertError> {
        let rule = {
            let mut state = self.state.lock().await;
            let rule = state
                .rules
                .get_mut(rule_id)
                .ok_or_else(|| AlertError::NotFound(rule_id.to_string()))?;
            rule.unmute();
            rule.clone()
        };
        self.persist_rule(&rule).await?;
        self.store
            .audit(AuditEntry {
                actor: by.to_string(),
                action: "rule_unmuted".into(),
                entity: rule_key(rule_id),
                detail: String::new(),
            })
            .await?;
        Ok(())
    }

    /// One alert by id.
    pub async fn get_alert(&self, id: &AlertId) -> Option<Alert> {
        self.state.lock().await.alerts.get(id).cloned()
    }

    /// Alerts matching a filter, newest first.
    pub async fn list_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .filter(|a| filter.severity.is_none_or(|s| a.severity == s))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let per_page = if filter.per_page == 0 { 50 } else { filter.per_page };
        alerts
            .into_iter()
            .skip(filter.page * per_page)
            .take(per_page)
            .collect()
    }

    /// All rules, id-ordered.
    pub async fn list_rules(&self) -> Vec<AlertRule> {
        let state = self.state.lock().await;
        let mut rules: Vec<AlertRule> = state.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Open (non-resolved) alert count.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    fn publish_state(&self, alert: &Alert, by: Option<String>) {
        self.bus.publish(
            Topic::AlertsState,
            BusMessage::AlertState {
                alert: Arc::new(alert.clone()),
                status: alert.status,
                by,
            },
        );
    }

    async fn persist_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        let value = serde_json::to_value(alert)
            .map_err(|e| argus_store::StoreError::Serialization(e.to_string()))?;
        self.store.catalog_put(alert_key(&alert.id), value).await?;
        Ok(())
    }

    async fn persist_rule(&self, rule: &AlertRule) -> Result<(), AlertError> {
        let value = serde_json::to_value(rule)
            .map_err(|e| argus_store::StoreError::Serialization(e.to_string()))?;
        self.store.catalog_put(rule_key(&rule.id), value).await?;
        Ok(())
    }
}

fn alert_key(id: &AlertId) -> String {
    format!("{CATALOG_PREFIX_ALERT}{id}")
}

fn rule_key(id: &RuleId) -> String {
    format!("{CATALOG_PREFIX_RULE}{id}")
}

/// One-line summary of the triggering event for the alert record.
fn summarize(event: &Event) -> String {
    match &event.payload {
        EventPayload::Metric { name, value, .. } => {
            format!("{name}={value} on {}", event.source)
        }
        EventPayload::Log { message, .. } => {
            let mut line = message.clone();
            if line.len() > 200 {
                line.truncate(200);
                line.push('…');
            }
            line
        }
        EventPayload::Span { name, duration_ms, .. } => {
            format!("span {name} took {duration_ms}ms")
        }
        EventPayload::Dependency { target, ok, latency_ms, .. } => {
            if *ok {
                format!("dependency {target} slow ({latency_ms}ms)")
            } else {
                format!("dependency {target} failing")
            }
        }
        EventPayload::Process { name, cpu_percent, .. } => {
            format!("process {name} at {cpu_percent}% cpu")
        }
        EventPayload::SecurityFinding { check, detail, .. } => {
            format!("{check}: {detail}")
        }
        EventPayload::SdkEvent { name, group, .. } => match group {
            Some(g) => format!("{name} ({g}) on {}", event.source),
            None => format!("{name} on {}", event.source),
        },
        EventPayload::AlertDerived { title, .. } => title.clone(),
    }
}
