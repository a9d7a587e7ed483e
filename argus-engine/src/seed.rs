//! Default alert rules seeded at first start.

use std::collections::BTreeSet;

use argus_types::{AlertRule, EventKind, RuleId, Severity};

fn rule(
    id: &str,
    name: &str,
    kinds: &[EventKind],
    min: Severity,
    pattern: Option<&str>,
    cooldown_s: u64,
    auto_investigate: bool,
) -> AlertRule {
    AlertRule {
        id: RuleId::new(id),
        name: name.to_string(),
        kinds: BTreeSet::from_iter(kinds.iter().copied()),
        min_severity: min,
        max_severity: None,
        pattern: pattern.map(str::to_string),
        cooldown_s,
        auto_investigate,
        mute_until: None,
        channels: vec!["log".to_string()],
    }
}

/// The rule set installed when the catalog holds no rules yet.
/// Re-seeding is idempotent: existing rules are never overwritten.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        rule(
            "cpu_critical",
            "CPU critical",
            &[EventKind::Metric],
            Severity::Urgent,
            Some("cpu"),
            300,
            true,
        ),
        rule(
            "memory_critical",
            "Memory critical",
            &[EventKind::Metric],
            Severity::Urgent,
            Some("memory"),
            300,
            true,
        ),
        rule(
            "disk_critical",
            "Disk critical",
            &[EventKind::Metric],
            Severity::Urgent,
            Some("disk"),
            900,
            false,
        ),
        rule(
            "error_burst",
            "Error burst",
            &[EventKind::Log],
            Severity::Urgent,
            None,
            300,
            true,
        ),
        rule(
            "log_notable",
            "Notable log activity",
            &[EventKind::Log],
            Severity::Notable,
            None,
            600,
            false,
        ),
        rule(
            "security_finding",
            "Security check failed",
            &[EventKind::SecurityFinding],
            Severity::Notable,
            None,
            3600,
            true,
        ),
        rule(
            "sdk_exception",
            "Application exception",
            &[EventKind::SdkEvent],
            Severity::Notable,
            Some("exception"),
            300,
            false,
        ),
        rule(
            "service_latency",
            "Service latency",
            &[EventKind::Span],
            Severity::Notable,
            None,
            600,
            false,
        ),
        rule(
            "dependency_failure",
            "Dependency failure",
            &[EventKind::Dependency],
            Severity::Notable,
            None,
            300,
            true,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let rules = default_rules();
        let mut ids: Vec<_> = rules.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), rules.len());
    }

    #[test]
    fn urgent_metric_rules_auto_investigate() {
        let rules = default_rules();
        let cpu = rules.iter().find(|r| r.id.as_str() == "cpu_critical").unwrap();
        assert!(cpu.auto_investigate);
        assert!(cpu.covers(EventKind::Metric, Severity::Urgent));
        assert!(!cpu.covers(EventKind::Metric, Severity::Notable));
    }
}
