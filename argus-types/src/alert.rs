//! Alert rules and fired alert instances.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::event::{Event, EventKind, Severity};
use crate::id::{AlertId, RuleId, RunId};

/// A catalog rule describing which classified events fire alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule id (human-readable slug, e.g. `cpu_critical`).
    pub id: RuleId,
    /// Display name.
    pub name: String,
    /// Event kinds this rule matches.
    pub kinds: BTreeSet<EventKind>,
    /// Minimum severity (inclusive).
    pub min_severity: Severity,
    /// Maximum severity (inclusive); `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_severity: Option<Severity>,
    /// Case-insensitive substring matched against the event's signal
    /// name; `None` matches every signal of the covered kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Minimum interval before the same dedup key may fire again.
    pub cooldown_s: u64,
    /// Start an investigation automatically on urgent firings.
    #[serde(default)]
    pub auto_investigate: bool,
    /// Suppress firings until this instant, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_until: Option<DateTime<Utc>>,
    /// Notification channel names to route firings to.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl AlertRule {
    /// Whether the rule covers this (kind, severity) pair.
    pub fn covers(&self, kind: EventKind, severity: Severity) -> bool {
        self.kinds.contains(&kind)
            && severity >= self.min_severity
            && self.max_severity.is_none_or(|max| severity <= max)
    }

    /// Whether the rule matches this event: kind + severity window +
    /// signal pattern.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.covers(event.kind(), event.severity) {
            return false;
        }
        match &self.pattern {
            Some(pattern) => event
                .signal()
                .to_lowercase()
                .contains(&pattern.to_lowercase()),
            None => true,
        }
    }

    /// Whether the rule is muted at `now`. Expired mutes count as unmuted;
    /// the stale `mute_until` is cleared lazily by the engine.
    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.mute_until.is_some_and(|until| now < until)
    }

    /// Extend the mute window. Muting twice never shortens the window:
    /// the new expiry is `max(now + duration, previous expiry)`.
    pub fn mute(&mut self, now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        let candidate = now + duration;
        let expiry = match self.mute_until {
            Some(prev) if prev > candidate => prev,
            _ => candidate,
        };
        self.mute_until = Some(expiry);
        expiry
    }

    /// Clear any mute.
    pub fn unmute(&mut self) {
        self.mute_until = None;
    }

    /// Cooldown as a chrono duration.
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_s as i64)
    }
}

/// Lifecycle state of a fired alert.
///
/// Transitions are monotonic: `Active -> Acknowledged -> Resolved`, with
/// `Active -> Resolved` allowed. Nothing leaves `Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Firing, nobody has taken it.
    Active,
    /// An operator has seen it.
    Acknowledged,
    /// Closed out.
    Resolved,
}

/// A fired alert instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id.
    pub id: AlertId,
    /// Rule that fired this alert.
    pub rule_id: RuleId,
    /// Severity of the triggering event at fire time.
    pub severity: Severity,
    /// Title, derived from the rule name.
    pub title: String,
    /// Summary, derived from the triggering event.
    pub summary: String,
    /// Host or service that produced the triggering event.
    pub source: String,
    /// When the alert fired.
    pub timestamp: DateTime<Utc>,
    /// Lifecycle state.
    pub status: AlertStatus,
    /// Dedup key the alert is keyed under (with its rule).
    pub dedup_key: String,
    /// When the alert was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// When the alert was acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Operator that acknowledged it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    /// Auto-investigation attached to this alert, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investigation_id: Option<RunId>,
}

impl Alert {
    /// Whether the alert still occupies its (rule, dedup key) slot.
    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }
}
