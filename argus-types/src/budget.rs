//! Budget accounting types shared between the manager and its consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority class for budget admission.
///
/// Higher priorities are admitted later into a saturated window;
/// `Critical` may dip into a dedicated reserve.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background and user chat traffic.
    #[default]
    Routine,
    /// User-initiated work that should not be starved.
    Elevated,
    /// Auto-investigations of urgent alerts.
    Urgent,
    /// Operator-forced work; may use the critical reserve.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Routine => "routine",
            Priority::Elevated => "elevated",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Point-in-time budget state, published on `budget.update` and returned
/// by `GET /budget`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BudgetSnapshot {
    /// Tokens settled in the rolling hourly window.
    pub hourly_used: u64,
    /// Hourly window limit.
    pub hourly_limit: u64,
    /// Tokens settled in the rolling daily window.
    pub daily_used: u64,
    /// Daily window limit.
    pub daily_limit: u64,
    /// Tokens currently reserved by in-flight requests.
    pub reserved: u64,
    /// Tokens drawn from the critical reserve in the hourly window.
    pub critical_used: u64,
    /// Size of the critical reserve.
    pub critical_reserve: u64,
}

impl BudgetSnapshot {
    /// Tokens still admissible in the hourly window (ignoring the
    /// critical reserve).
    pub fn hourly_headroom(&self) -> u64 {
        self.hourly_limit
            .saturating_sub(self.hourly_used + self.reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_is_ordered() {
        assert!(Priority::Routine < Priority::Elevated);
        assert!(Priority::Elevated < Priority::Urgent);
        assert!(Priority::Urgent < Priority::Critical);
    }

    #[test]
    fn headroom_saturates() {
        let snap = BudgetSnapshot {
            hourly_used: 900,
            hourly_limit: 1000,
            reserved: 200,
            ..Default::default()
        };
        assert_eq!(snap.hourly_headroom(), 0);
    }
}
