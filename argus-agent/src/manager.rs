//! Run tracking: cancellation scopes tying runs to connections and
//! alerts, plus conversation persistence helpers.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use argus_store::Store;
use argus_types::{AlertId, ConnectionId, ConversationId, Message, RunId};

/// Catalog prefix for conversation transcripts.
const CATALOG_PREFIX_CONVERSATION: &str = "conv:";

/// What a run's lifetime is tied to.
#[derive(Debug, Clone, PartialEq)]
pub enum RunScope {
    /// A user-chat run; cancelled when its connection closes.
    Connection(ConnectionId),
    /// An auto-investigation; cancelled when its alert resolves.
    Alert(AlertId),
    /// Not tied to anything external.
    Detached,
}

struct RunHandle {
    cancel: CancellationToken,
    scope: RunScope,
}

/// Tracks in-flight runs and their cancellation scopes.
#[derive(Default)]
pub struct RunManager {
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl RunManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run; returns the token its tasks should watch.
    pub fn register(&self, run_id: RunId, scope: RunScope) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).insert(
            run_id,
            RunHandle {
                cancel: cancel.clone(),
                scope,
            },
        );
        cancel
    }

    /// Drop a finished run.
    pub fn complete(&self, run_id: &RunId) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
    }

    /// Cancel one run. Returns whether it was known.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        match runs.get(run_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the chat runs scoped to a closed connection.
    /// Auto-investigations are left running.
    pub fn cancel_for_connection(&self, connection: &ConnectionId) {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        for handle in runs.values() {
            if handle.scope == RunScope::Connection(connection.clone()) {
                handle.cancel.cancel();
            }
        }
    }

    /// Cancel the investigation attached to a resolved alert.
    pub fn cancel_for_alert(&self, alert_id: &AlertId) {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        for handle in runs.values() {
            if handle.scope == RunScope::Alert(alert_id.clone()) {
                handle.cancel.cancel();
            }
        }
    }

    /// Runs currently in flight.
    pub fn active_count(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Load a conversation transcript from the catalog (empty when new).
pub async fn load_conversation(store: &Store, id: &ConversationId) -> Vec<Message> {
    match store
        .catalog_get(format!("{CATALOG_PREFIX_CONVERSATION}{id}"))
        .await
    {
        Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::warn!(conversation = %id, err = %e, "conversation load failed");
            Vec::new()
        }
    }
}

/// Persist a conversation transcript.
pub async fn save_conversation(store: &Store, id: &ConversationId, messages: &[Message]) {
    let Ok(value) = serde_json::to_value(messages) else {
        tracing::error!(conversation = %id, "conversation serialize failed");
        return;
    };
    if let Err(e) = store
        .catalog_put(format!("{CATALOG_PREFIX_CONVERSATION}{id}"), value)
        .await
    {
        tracing::warn!(conversation = %id, err = %e, "conversation save failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_scope_cancels_only_its_runs() {
        let manager = RunManager::new();
        let chat = manager.register(
            RunId::new("r-chat"),
            RunScope::Connection(ConnectionId::new("c-1")),
        );
        let other_chat = manager.register(
            RunId::new("r-other"),
            RunScope::Connection(ConnectionId::new("c-2")),
        );
        let investigation =
            manager.register(RunId::new("r-inv"), RunScope::Alert(AlertId::new("a-1")));

        manager.cancel_for_connection(&ConnectionId::new("c-1"));
        assert!(chat.is_cancelled());
        assert!(!other_chat.is_cancelled());
        assert!(
            !investigation.is_cancelled(),
            "investigations outlive connections"
        );
    }

    #[test]
    fn alert_scope_cancels_investigation() {
        let manager = RunManager::new();
        let investigation =
            manager.register(RunId::new("r-inv"), RunScope::Alert(AlertId::new("a-1")));
        manager.cancel_for_alert(&AlertId::new("a-1"));
        assert!(investigation.is_cancelled());
    }

    #[test]
    fn cancel_reports_unknown_runs() {
        let manager = RunManager::new();
        assert!(!manager.cancel(&RunId::new("ghost")));
        manager.register(RunId::new("r-1"), RunScope::Detached);
        assert!(manager.cancel(&RunId::new("r-1")));
        manager.complete(&RunId::new("r-1"));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn conversation_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let id = ConversationId::new("conv-1");
        assert!(load_conversation(&store, &id).await.is_empty());

        let messages = vec![Message::user("hello")];
        save_conversation(&store, &id, &messages).await;
        let loaded = load_conversation(&store, &id).await;
        assert_eq!(loaded, messages);
    }
}
