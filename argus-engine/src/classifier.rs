//! Event classification: raw events in, severities out.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use argus_types::{Event, EventPayload, LogLevel, Severity};

/// Burst window width for counting repeats.
fn burst_window() -> Duration {
    Duration::seconds(60)
}

/// Errors within the window that escalate a burst to urgent.
const ERROR_BURST_URGENT: usize = 10;
/// Dependency failures within the window that escalate to urgent.
const DEPENDENCY_BURST_URGENT: usize = 5;
/// Grouped exceptions within the window that escalate to urgent.
const EXCEPTION_BURST_URGENT: usize = 5;

/// Metric families with (urgent, notable) thresholds in percent.
const METRIC_THRESHOLDS: &[(&str, f64, f64)] = &[
    ("cpu", 90.0, 75.0),
    ("memory", 90.0, 80.0),
    ("disk", 95.0, 85.0),
];

/// Log substrings that force an urgent classification.
const URGENT_LOG_PATTERNS: &[&str] = &["panic", "fatal", "out of memory", "segfault"];
/// Log substrings that mark a line notable.
const NOTABLE_LOG_PATTERNS: &[&str] = &["error", "exception", "failed", "refused"];

/// Span duration above which a span is notable, in milliseconds.
const SLOW_SPAN_MS: f64 = 5_000.0;
/// Dependency latency above which a call is notable, in milliseconds.
const SLOW_DEPENDENCY_MS: f64 = 2_000.0;

/// A sliding event-count window keyed by (host, signal).
#[derive(Debug, Default)]
struct BurstCounter {
    hits: VecDeque<DateTime<Utc>>,
}

impl BurstCounter {
    /// Record a hit and return the count inside the window.
    fn record(&mut self, at: DateTime<Utc>) -> usize {
        let cutoff = at - burst_window();
        while self.hits.front().is_some_and(|t| *t < cutoff) {
            self.hits.pop_front();
        }
        self.hits.push_back(at);
        self.hits.len()
    }
}

/// Maps raw events to severities.
///
/// Stateless except for small sliding-window counters keyed by
/// (host, signal) and the last-seen status of security checks; counters
/// reset at window expiry. When several rules match, the highest severity
/// wins.
#[derive(Debug, Default)]
pub struct Classifier {
    bursts: HashMap<(String, String), BurstCounter>,
    security_status: HashMap<(String, String), bool>,
}

impl Classifier {
    /// Create a classifier with empty windows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one event. Mutates only the sliding-window state.
    pub fn classify(&mut self, event: &Event) -> Severity {
        match &event.payload {
            EventPayload::Metric { name, value, .. } => classify_metric(name, *value),
            EventPayload::Log { message, level, .. } => {
                self.classify_log(&event.source, message, *level, event.timestamp)
            }
            EventPayload::Span { duration_ms, ok, .. } => {
                if !ok || *duration_ms > SLOW_SPAN_MS {
                    Severity::Notable
                } else {
                    Severity::Info
                }
            }
            EventPayload::Dependency {
                target,
                latency_ms,
                ok,
                ..
            } => self.classify_dependency(&event.source, target, *latency_ms, *ok, event.timestamp),
            EventPayload::Process {
                cpu_percent,
                memory_mb,
                ..
            } => {
                if *cpu_percent >= 95.0 || *memory_mb >= 2048.0 {
                    Severity::Notable
                } else {
                    Severity::Info
                }
            }
            EventPayload::SecurityFinding { check, passed, .. } => {
                self.classify_security(&event.source, check, *passed)
            }
            EventPayload::SdkEvent { name, group, .. } => {
                self.classify_sdk(&event.source, name, group.as_deref(), event.timestamp)
            }
            // Alert-derived events never re-alert.
            EventPayload::AlertDerived { .. } => Severity::Info,
        }
    }

    fn burst(&mut self, host: &str, signal: &str, at: DateTime<Utc>) -> usize {
        self.bursts
            .entry((host.to_string(), signal.to_string()))
            .or_default()
            .record(at)
    }

    fn classify_log(
        &mut self,
        source: &str,
        message: &str,
        level: LogLevel,
        at: DateTime<Utc>,
    ) -> Severity {
        let lower = message.to_lowercase();
        let mut severity = Severity::Info;

        if URGENT_LOG_PATTERNS.iter().any(|p| lower.contains(p)) {
            severity = severity.max(Severity::Urgent);
        } else if NOTABLE_LOG_PATTERNS.iter().any(|p| lower.contains(p)) {
            severity = severity.max(Severity::Notable);
        }

        if level >= LogLevel::Error {
            let count = self.burst(source, "log_error", at);
            severity = severity.max(if count >= ERROR_BURST_URGENT {
                Severity::Urgent
            } else {
                Severity::Notable
            });
        }

        severity
    }

    fn classify_dependency(
        &mut self,
        source: &str,
        target: &str,
        latency_ms: f64,
        ok: bool,
        at: DateTime<Utc>,
    ) -> Severity {
        let mut severity = Severity::Info;
        if latency_ms > SLOW_DEPENDENCY_MS {
            severity = Severity::Notable;
        }
        if !ok {
            let count = self.burst(source, &format!("dep_fail:{target}"), at);
            severity = severity.max(if count >= DEPENDENCY_BURST_URGENT {
                Severity::Urgent
            } else {
                Severity::Notable
            });
        }
        severity
    }

    fn classify_security(&mut self, source: &str, check: &str, passed: bool) -> Severity {
        let key = (source.to_string(), check.to_string());
        let previous = self.security_status.insert(key, passed);
        if passed {
            Severity::Info
        } else if previous == Some(false) {
            // Still failing: already alerted on the transition.
            Severity::Notable
        } else {
            // Fresh failure (or first observation failing).
            Severity::Urgent
        }
    }

    fn classify_sdk(
        &mut self,
        source: &str,
        name: &str,
        group: Option<&str>,
        at: DateTime<Utc>,
    ) -> Severity {
        if name != "exception" {
            return Severity::Info;
        }
        let signal = format!("exception:{}", group.unwrap_or("ungrouped"));
        let count = self.burst(source, &signal, at);
        if count >= EXCEPTION_BURST_URGENT {
            Severity::Urgent
        } else {
            Severity::Notable
        }
    }
}

fn classify_metric(name: &str, value: f64) -> Severity {
    let lower = name.to_lowercase();
    for (family, urgent, notable) in METRIC_THRESHOLDS {
        if lower.contains(family) {
            if value >= *urgent {
                return Severity::Urgent;
            }
            if value >= *notable {
                return Severity::Notable;
            }
            return Severity::Info;
        }
    }
    Severity::Info
}
