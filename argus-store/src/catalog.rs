//! Catalog record keys and audit log types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key prefix for alert rules.
pub const CATALOG_PREFIX_RULE: &str = "rule:";
/// Key prefix for fired alerts.
pub const CATALOG_PREFIX_ALERT: &str = "alert:";
/// Key prefix for completed runs and investigations.
pub const CATALOG_PREFIX_RUN: &str = "run:";
/// Key prefix for ingest API credentials.
pub const CATALOG_PREFIX_CREDENTIAL: &str = "apikey:";

/// An audit entry as submitted by a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Who performed the transition (operator name or `system`).
    pub actor: String,
    /// What happened, e.g. `acknowledge`, `action_approved`.
    pub action: String,
    /// The entity acted on, e.g. `alert:a-1`.
    pub entity: String,
    /// Free-form detail.
    pub detail: String,
}

/// A persisted audit record with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number.
    pub seq: u64,
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
    /// Who performed the transition.
    pub actor: String,
    /// What happened.
    pub action: String,
    /// The entity acted on.
    pub entity: String,
    /// Free-form detail.
    pub detail: String,
}
