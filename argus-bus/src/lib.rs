#![deny(missing_docs)]
//! In-process typed pub/sub spine.
//!
//! Every producer publishes onto a [`Topic`]; every consumer holds a
//! [`Subscription`] with its own bounded queue. A slow subscriber loses
//! its own oldest messages (counted per subscriber) and never slows the
//! publisher or its peers. Delivery is at-most-once per subscriber and
//! ordered per topic per subscriber.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use argus_types::{
    ActionId, ActionRequest, Alert, AlertStatus, BudgetSnapshot, Envelope, Event, StatusSnapshot,
};

/// The topics on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Raw accepted telemetry, pre-classification.
    TelemetryRaw,
    /// Classified telemetry (severity assigned).
    EventsClassified,
    /// Alert firings.
    AlertsFired,
    /// Alert lifecycle transitions.
    AlertsState,
    /// Actions awaiting approval.
    ActionsRequested,
    /// Actions that finished (executed, rejected, or timed out).
    ActionsCompleted,
    /// Ordered per-run push traffic from the ReAct loop.
    ReactDelta,
    /// Budget counter changes.
    BudgetUpdate,
    /// Periodic server status.
    SystemStatus,
}

impl Topic {
    /// All topics, for iteration.
    pub const ALL: [Topic; 9] = [
        Topic::TelemetryRaw,
        Topic::EventsClassified,
        Topic::AlertsFired,
        Topic::AlertsState,
        Topic::ActionsRequested,
        Topic::ActionsCompleted,
        Topic::ReactDelta,
        Topic::BudgetUpdate,
        Topic::SystemStatus,
    ];

    /// The dotted wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::TelemetryRaw => "telemetry.raw",
            Topic::EventsClassified => "events.classified",
            Topic::AlertsFired => "alerts.fired",
            Topic::AlertsState => "alerts.state",
            Topic::ActionsRequested => "actions.requested",
            Topic::ActionsCompleted => "actions.completed",
            Topic::ReactDelta => "react.delta",
            Topic::BudgetUpdate => "budget.update",
            Topic::SystemStatus => "system.status",
        }
    }

    fn index(&self) -> usize {
        Topic::ALL.iter().position(|t| t == self).unwrap_or(0)
    }
}

/// The payloads carried on the bus, one variant per topic family.
#[derive(Debug, Clone)]
pub enum BusMessage {
    /// `telemetry.raw`: an accepted event before classification.
    Telemetry(Arc<Event>),
    /// `events.classified`: an event with severity assigned.
    Classified(Arc<Event>),
    /// `alerts.fired`: a freshly fired alert.
    AlertFired(Arc<Alert>),
    /// `alerts.state`: a lifecycle transition.
    AlertState {
        /// The transitioned alert.
        alert: Arc<Alert>,
        /// The new status.
        status: AlertStatus,
        /// Operator identity for acknowledge transitions.
        by: Option<String>,
    },
    /// `actions.requested`: an action awaiting approval.
    ActionRequested(Arc<ActionRequest>),
    /// `actions.completed`: terminal action outcome.
    ActionCompleted {
        /// The action.
        action_id: ActionId,
        /// Exit code when the command executed.
        exit_code: Option<i32>,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
        /// Error description for rejection/timeout/fault paths.
        error: Option<String>,
    },
    /// `react.delta`: a ready-to-send push envelope from a run.
    ReactDelta(Arc<Envelope>),
    /// `budget.update`: new counters after a reserve or settle.
    Budget(BudgetSnapshot),
    /// `system.status`: periodic snapshot.
    Status(Arc<StatusSnapshot>),
}

/// Shared state of one subscriber's queue.
struct SubscriberQueue {
    queue: Mutex<VecDeque<BusMessage>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, message: BusMessage) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }
}

/// A handle to one subscriber's bounded queue on one topic.
///
/// Dropping the subscription unsubscribes; dropping twice (or after the
/// bus is gone) is harmless.
pub struct Subscription {
    inner: Arc<SubscriberQueue>,
    topic: Topic,
}

impl Subscription {
    /// Receive the next message, waiting until one arrives.
    ///
    /// Returns `None` once the bus has been shut down and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(message) = queue.pop_front() {
                    return Some(message);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notified().await;
        }
    }

    /// Take the next message if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Messages dropped from this subscriber's queue because it was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// The topic this subscription listens on.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl SubscriberQueue {
    async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct TopicSlot {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
}

/// The bus. Cheap to clone; all clones share the fan-out table.
#[derive(Clone)]
pub struct Bus {
    topics: Arc<[TopicSlot; 9]>,
    capacity: usize,
}

impl Bus {
    /// Create a bus with the default per-subscriber capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with a custom per-subscriber queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            topics: Arc::new(std::array::from_fn(|_| TopicSlot {
                subscribers: Mutex::new(Vec::new()),
            })),
            capacity,
        }
    }

    /// Subscribe to a topic with the bus's default queue capacity.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.subscribe_with_capacity(topic, self.capacity)
    }

    /// Subscribe with an explicit queue capacity.
    pub fn subscribe_with_capacity(&self, topic: Topic, capacity: usize) -> Subscription {
        let inner = Arc::new(SubscriberQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let slot = &self.topics[topic.index()];
        slot.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&inner));
        Subscription { inner, topic }
    }

    /// Publish a message to every live subscriber of the topic.
    ///
    /// Synchronous: returns after enqueueing on all subscriber queues.
    /// Never blocks on a slow subscriber; a full queue loses its oldest
    /// message instead.
    pub fn publish(&self, topic: Topic, message: BusMessage) {
        let slot = &self.topics[topic.index()];
        let mut subscribers = slot.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        match subscribers.len() {
            0 => {}
            1 => subscribers[0].push(message),
            n => {
                for subscriber in subscribers.iter().take(n - 1) {
                    subscriber.push(message.clone());
                }
                subscribers[n - 1].push(message);
            }
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let slot = &self.topics[topic.index()];
        let mut subscribers = slot.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        subscribers.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::{EventPayload, Severity};

    fn metric_event(value: f64) -> Arc<Event> {
        Arc::new(Event::new(
            "web-1",
            EventPayload::Metric {
                name: "cpu.percent".into(),
                value,
                unit: None,
            },
        ))
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topic::TelemetryRaw);
        for i in 0..5 {
            bus.publish(Topic::TelemetryRaw, BusMessage::Telemetry(metric_event(i as f64)));
        }
        for i in 0..5 {
            match sub.recv().await.unwrap() {
                BusMessage::Telemetry(e) => match &e.payload {
                    EventPayload::Metric { value, .. } => assert_eq!(*value, i as f64),
                    _ => panic!("wrong payload"),
                },
                _ => panic!("wrong message"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_only_for_itself() {
        let bus = Bus::new();
        let mut slow = bus.subscribe_with_capacity(Topic::TelemetryRaw, 2);
        let mut fast = bus.subscribe_with_capacity(Topic::TelemetryRaw, 16);

        for i in 0..4 {
            bus.publish(Topic::TelemetryRaw, BusMessage::Telemetry(metric_event(i as f64)));
        }

        // The slow subscriber lost the two oldest messages.
        assert_eq!(slow.dropped(), 2);
        match slow.recv().await.unwrap() {
            BusMessage::Telemetry(e) => match &e.payload {
                EventPayload::Metric { value, .. } => assert_eq!(*value, 2.0),
                _ => panic!("wrong payload"),
            },
            _ => panic!("wrong message"),
        }

        // The fast subscriber saw everything.
        assert_eq!(fast.dropped(), 0);
        let mut seen = 0;
        while fast.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn publish_does_not_cross_topics() {
        let bus = Bus::new();
        let mut raw = bus.subscribe(Topic::TelemetryRaw);
        let mut classified = bus.subscribe(Topic::EventsClassified);

        let mut event = (*metric_event(1.0)).clone();
        event.severity = Severity::Urgent;
        bus.publish(Topic::EventsClassified, BusMessage::Classified(Arc::new(event)));

        assert!(raw.try_recv().is_none());
        assert!(classified.try_recv().is_some());
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = Bus::new();
        let sub = bus.subscribe(Topic::AlertsFired);
        assert_eq!(bus.subscriber_count(Topic::AlertsFired), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(Topic::AlertsFired), 0);
        // Publishing to a topic with no subscribers is a no-op.
        bus.publish(Topic::AlertsFired, BusMessage::Telemetry(metric_event(0.0)));
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topic::BudgetUpdate);
        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            publisher.publish(Topic::BudgetUpdate, BusMessage::Budget(BudgetSnapshot::default()));
        });
        let message = sub.recv().await;
        assert!(matches!(message, Some(BusMessage::Budget(_))));
        handle.await.unwrap();
    }

    #[test]
    fn topic_names_are_dotted() {
        assert_eq!(Topic::TelemetryRaw.as_str(), "telemetry.raw");
        assert_eq!(Topic::ReactDelta.as_str(), "react.delta");
        assert_eq!(Topic::ALL.len(), 9);
    }
}
