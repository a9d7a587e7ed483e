//! Notification sink interface.
//!
//! Slack, email, and friends live outside the core; they plug in behind
//! [`Notifier`]. The core ships a tracing-backed sink so firings are
//! always visible somewhere.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use argus_types::Alert;

/// Errors from notification delivery.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The channel could not deliver the notification.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

/// A notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The channel name rules refer to.
    fn name(&self) -> &str;

    /// Deliver an alert notification.
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Sink that writes firings to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        tracing::warn!(
            alert_id = %alert.id,
            rule = %alert.rule_id,
            severity = %alert.severity,
            source = %alert.source,
            "alert fired: {}",
            alert.title
        );
        Ok(())
    }
}

/// Registry of notification channels by name.
#[derive(Default)]
pub struct NotifierRegistry {
    channels: HashMap<String, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel; replaces any channel with the same name.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.channels.insert(notifier.name().to_string(), notifier);
    }

    /// Deliver to the named channels; unknown names are skipped with a
    /// warning, delivery failures are logged and do not propagate.
    pub async fn dispatch(&self, channels: &[String], alert: &Alert) {
        for name in channels {
            match self.channels.get(name) {
                Some(notifier) => {
                    if let Err(e) = notifier.notify(alert).await {
                        tracing::warn!(channel = %name, err = %e, "notification failed");
                    }
                }
                None => tracing::warn!(channel = %name, "unknown notification channel"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::{AlertId, AlertStatus, RuleId, Severity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn alert() -> Alert {
        Alert {
            id: AlertId::new("a-1"),
            rule_id: RuleId::new("cpu_critical"),
            severity: Severity::Urgent,
            title: "CPU critical".into(),
            summary: "cpu.percent=97".into(),
            source: "web-1".into(),
            timestamp: chrono::Utc::now(),
            status: AlertStatus::Active,
            dedup_key: "web-1:cpu.percent".into(),
            resolved_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            investigation_id: None,
        }
    }

    struct CountingNotifier {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        fn name(&self) -> &str {
            "counting"
        }
        async fn notify(&self, _alert: &Alert) -> Result<(), NotifyError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_name() {
        let counting = Arc::new(CountingNotifier {
            delivered: AtomicUsize::new(0),
        });
        let mut registry = NotifierRegistry::new();
        registry.register(counting.clone());
        registry.register(Arc::new(LogNotifier));

        registry
            .dispatch(
                &["counting".into(), "missing".into(), "log".into()],
                &alert(),
            )
            .await;
        assert_eq!(counting.delivered.load(Ordering::SeqCst), 1);
    }
}
