//! Shared application state and the push connection registry.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use argus_agent::{ActionEngine, ReactRunner, RunManager};
use argus_bus::Bus;
use argus_engine::{AlertEngine, BudgetManager};
use argus_providers::LlmClient;
use argus_store::Store;
use argus_types::{Config, ConnectionId, Envelope, ServerMessage};

/// Default outbound queue capacity per connection.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Store queue depth above which ingest pushes back.
pub const INGEST_HIGH_WATER: usize = 512;

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The pub/sub spine.
    pub bus: Bus,
    /// The store handle.
    pub store: Store,
    /// Alert lifecycle owner.
    pub alerts: Arc<AlertEngine>,
    /// Token budget owner.
    pub budget: Arc<BudgetManager>,
    /// Pending action owner.
    pub actions: Arc<ActionEngine>,
    /// Run cancellation scopes.
    pub runs: Arc<RunManager>,
    /// The ReAct runner over the configured provider.
    pub runner: Arc<ReactRunner<LlmClient>>,
    /// Live push connections.
    pub connections: ConnectionRegistry,
    /// Root cancellation for graceful shutdown.
    pub shutdown: CancellationToken,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// Why a queue push did not enqueue normally.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued (possibly after evicting something).
    Enqueued,
    /// Queue was full of critical messages; the connection must close.
    Overflow,
}

/// Bounded per-connection outbound FIFO with the critical-type overflow
/// policy: a non-critical arrival drops the queue head; a critical
/// arrival evicts the newest non-critical message instead; a queue full
/// of critical messages closes the connection.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    /// A queue bounded at `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an envelope under the overflow policy.
    pub fn push(&self, envelope: Envelope) -> PushOutcome {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() < self.capacity {
            queue.push_back(envelope);
            drop(queue);
            self.notify.notify_one();
            return PushOutcome::Enqueued;
        }

        if !envelope.message.is_critical() {
            queue.pop_front();
            queue.push_back(envelope);
            drop(queue);
            self.notify.notify_one();
            return PushOutcome::Enqueued;
        }

        match queue.iter().rposition(|e| !e.message.is_critical()) {
            Some(position) => {
                queue.remove(position);
                queue.push_back(envelope);
                drop(queue);
                self.notify.notify_one();
                PushOutcome::Enqueued
            }
            None => {
                self.closed.store(true, Ordering::Release);
                drop(queue);
                self.notify.notify_one();
                PushOutcome::Overflow
            }
        }
    }

    /// Dequeue the next envelope; `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(envelope) = queue.pop_front() {
                    return Some(envelope);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Whether the queue hit the backpressure close condition.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live push connections, keyed by connection id.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, Arc<OutboundQueue>>>>,
}

impl ConnectionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's queue.
    pub fn insert(&self, id: ConnectionId, queue: Arc<OutboundQueue>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, queue);
    }

    /// Drop a connection.
    pub fn remove(&self, id: &ConnectionId) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Connected client count.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no clients are connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an envelope on every live connection.
    pub fn broadcast(&self, envelope: &Envelope) {
        let connections = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for queue in connections.values() {
            // Overflow marks the queue closed; its connection task will
            // tear the session down on its next poll.
            let _ = queue.push(envelope.clone());
        }
    }

    /// Enqueue a freshly-stamped message on every live connection.
    pub fn broadcast_message(&self, message: ServerMessage) {
        self.broadcast(&Envelope::new(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::RunId;

    fn delta(n: u32) -> Envelope {
        Envelope::new(ServerMessage::AssistantMessageDelta {
            run_id: RunId::new("r-1"),
            delta: n.to_string(),
        })
    }

    fn error_message() -> Envelope {
        Envelope::new(ServerMessage::Error {
            code: "internal".into(),
            message: "x".into(),
            correlation_id: None,
            run_id: None,
        })
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = OutboundQueue::new(8);
        for n in 0..4 {
            assert_eq!(queue.push(delta(n)), PushOutcome::Enqueued);
        }
        let drained: Vec<String> = std::iter::from_fn(|| {
            let mut inner = queue.inner.lock().unwrap();
            inner.pop_front()
        })
        .map(|e| serde_json::to_value(&e).unwrap()["data"]["delta"].as_str().unwrap().to_string())
        .collect();
        assert_eq!(drained, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn noncritical_overflow_drops_head() {
        let queue = OutboundQueue::new(2);
        queue.push(delta(0));
        queue.push(delta(1));
        assert_eq!(queue.push(delta(2)), PushOutcome::Enqueued);
        assert_eq!(queue.len(), 2);
        let first = queue.inner.lock().unwrap().pop_front().unwrap();
        let value = serde_json::to_value(&first).unwrap();
        assert_eq!(value["data"]["delta"], "1", "oldest dropped");
    }

    #[test]
    fn critical_overflow_evicts_newest_noncritical() {
        let queue = OutboundQueue::new(3);
        queue.push(error_message());
        queue.push(delta(0));
        queue.push(delta(1));
        assert_eq!(queue.push(error_message()), PushOutcome::Enqueued);

        let types: Vec<String> = std::iter::from_fn(|| queue.inner.lock().unwrap().pop_front())
            .map(|e| {
                serde_json::to_value(&e).unwrap()["type"].as_str().unwrap().to_string()
            })
            .collect();
        // delta(1) (the newest non-critical) was evicted.
        assert_eq!(types, vec!["error", "assistant_message_delta", "error"]);
    }

    #[test]
    fn all_critical_overflow_closes() {
        let queue = OutboundQueue::new(2);
        queue.push(error_message());
        queue.push(error_message());
        assert_eq!(queue.push(error_message()), PushOutcome::Overflow);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn recv_drains_then_ends_after_close() {
        let queue = OutboundQueue::new(2);
        queue.push(delta(0));
        queue.closed.store(true, Ordering::Release);
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }

    #[test]
    fn registry_broadcast_reaches_all() {
        let registry = ConnectionRegistry::new();
        let a = Arc::new(OutboundQueue::new(8));
        let b = Arc::new(OutboundQueue::new(8));
        registry.insert(ConnectionId::new("a"), Arc::clone(&a));
        registry.insert(ConnectionId::new("b"), Arc::clone(&b));

        registry.broadcast_message(ServerMessage::Pong);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);

        registry.remove(&ConnectionId::new("a"));
        assert_eq!(registry.len(), 1);
    }
}
