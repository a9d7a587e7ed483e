#![deny(missing_docs)]
//! Time-series store, catalog, and audit log.
//!
//! One rusqlite connection, owned by a dedicated writer thread. All
//! access goes through [`Store`], a cloneable handle that sends commands
//! over a bounded queue and awaits oneshot replies. Writes serialize
//! through the queue (giving read-your-writes for a single caller);
//! queries carry a hard deadline. Queue depth is observable so the
//! ingestion endpoint can push back before the store drowns.

mod catalog;
mod db;
mod error;
mod telemetry;

pub use catalog::{AuditEntry, AuditRecord, CATALOG_PREFIX_ALERT, CATALOG_PREFIX_CREDENTIAL,
    CATALOG_PREFIX_RULE, CATALOG_PREFIX_RUN};
pub use error::StoreError;
pub use telemetry::{
    Agg, AggregateRow, AggregateSpec, Order, QueryResult, QuerySpec, RetentionPolicy, Row,
    TelemetryKind,
};

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::db::Database;

/// Hard deadline for store queries.
pub const QUERY_DEADLINE: Duration = Duration::from_secs(5);

/// Command queue capacity; depth against this is the backpressure signal.
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

pub(crate) enum Command {
    Append {
        rows: Vec<Row>,
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
    Query {
        spec: QuerySpec,
        reply: oneshot::Sender<Result<QueryResult, StoreError>>,
    },
    Aggregate {
        spec: AggregateSpec,
        reply: oneshot::Sender<Result<Vec<AggregateRow>, StoreError>>,
    },
    Purge {
        retention: RetentionPolicy,
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    CatalogPut {
        key: String,
        value: serde_json::Value,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    CatalogGet {
        key: String,
        reply: oneshot::Sender<Result<Option<serde_json::Value>, StoreError>>,
    },
    CatalogList {
        prefix: String,
        reply: oneshot::Sender<Result<Vec<(String, serde_json::Value)>, StoreError>>,
    },
    CatalogDelete {
        key: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    AuditAppend {
        entry: AuditEntry,
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    AuditList {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<AuditRecord>, StoreError>>,
    },
}

/// Cloneable handle to the store actor.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<Command>,
    depth: Arc<AtomicUsize>,
}

impl Store {
    /// Open (or create) the database at `path` and spawn the writer
    /// thread.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::open(path)?;
        Ok(Self::spawn(db))
    }

    /// Open an in-memory database; state lives as long as the handle.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Database::open_in_memory()?;
        Ok(Self::spawn(db))
    }

    fn spawn(mut db: Database) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(COMMAND_QUEUE_CAPACITY);
        let depth = Arc::new(AtomicUsize::new(0));
        let actor_depth = Arc::clone(&depth);
        std::thread::Builder::new()
            .name("argus-store".into())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    db.handle(command);
                    actor_depth.fetch_sub(1, Ordering::Release);
                }
                tracing::debug!("store actor shutting down");
            })
            .expect("failed to spawn store thread");
        Self { tx, depth }
    }

    /// Pending commands in the actor queue.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    async fn send<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        self.depth.fetch_add(1, Ordering::Release);
        if self.tx.send(command).await.is_err() {
            self.depth.fetch_sub(1, Ordering::Release);
            return Err(StoreError::Closed);
        }
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn send_with_deadline<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(QUERY_DEADLINE, self.send(command, rx)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Deadline),
        }
    }

    /// Append a batch of rows. Atomic: either the whole batch commits or
    /// none of it does. Returns the number of rows written once they are
    /// durably handed off.
    pub async fn append(&self, rows: Vec<Row>) -> Result<usize, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Append { rows, reply }, rx).await
    }

    /// Run a windowed query. Fails with [`StoreError::Deadline`] if the
    /// actor cannot answer within [`QUERY_DEADLINE`].
    pub async fn query(&self, spec: QuerySpec) -> Result<QueryResult, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_with_deadline(Command::Query { spec, reply }, rx)
            .await
    }

    /// Bucketed aggregation over a window.
    pub async fn aggregate(&self, spec: AggregateSpec) -> Result<Vec<AggregateRow>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_with_deadline(Command::Aggregate { spec, reply }, rx)
            .await
    }

    /// Delete rows older than the per-kind retention policy. Returns the
    /// number of rows removed.
    pub async fn purge(&self, retention: RetentionPolicy) -> Result<u64, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Purge { retention, reply }, rx).await
    }

    /// Upsert a catalog record under a prefix-indexed key.
    pub async fn catalog_put(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::CatalogPut {
                key: key.into(),
                value,
                reply,
            },
            rx,
        )
        .await
    }

    /// Fetch one catalog record.
    pub async fn catalog_get(
        &self,
        key: impl Into<String>,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_with_deadline(
            Command::CatalogGet {
                key: key.into(),
                reply,
            },
            rx,
        )
        .await
    }

    /// List catalog records whose key starts with `prefix`, key-ordered.
    pub async fn catalog_list(
        &self,
        prefix: impl Into<String>,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_with_deadline(
            Command::CatalogList {
                prefix: prefix.into(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Delete a catalog record. Returns whether it existed.
    pub async fn catalog_delete(&self, key: impl Into<String>) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::CatalogDelete {
                key: key.into(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Append an audit entry; returns its monotonic sequence number.
    pub async fn audit(&self, entry: AuditEntry) -> Result<u64, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AuditAppend { entry, reply }, rx).await
    }

    /// Most recent audit records, newest first.
    pub async fn audit_list(&self, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_with_deadline(Command::AuditList { limit, reply }, rx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::{Event, EventPayload};
    use chrono::{Duration as ChronoDuration, Utc};

    fn metric_row(value: f64) -> Row {
        let event = Event::new(
            "web-1",
            EventPayload::Metric {
                name: "cpu.percent".into(),
                value,
                unit: Some("percent".into()),
            },
        );
        Row::from_event(&event, false)
    }

    #[tokio::test]
    async fn append_then_query_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let written = store.append(vec![metric_row(97.0)]).await.unwrap();
        assert_eq!(written, 1);

        let now = Utc::now();
        let result = store
            .query(QuerySpec {
                kind: TelemetryKind::SystemMetrics,
                window: (now - ChronoDuration::minutes(1), now + ChronoDuration::minutes(1)),
                name: Some("cpu.percent".into()),
                ..QuerySpec::default_for(TelemetryKind::SystemMetrics)
            })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].value, Some(97.0));
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn query_reports_truncation() {
        let store = Store::open_in_memory().unwrap();
        let rows: Vec<Row> = (0..10).map(|i| metric_row(i as f64)).collect();
        store.append(rows).await.unwrap();

        let now = Utc::now();
        let result = store
            .query(QuerySpec {
                kind: TelemetryKind::SystemMetrics,
                window: (now - ChronoDuration::minutes(1), now + ChronoDuration::minutes(1)),
                limit: 5,
                ..QuerySpec::default_for(TelemetryKind::SystemMetrics)
            })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 5);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn catalog_prefix_listing() {
        let store = Store::open_in_memory().unwrap();
        store
            .catalog_put("rule:cpu_critical", serde_json::json!({"name": "CPU"}))
            .await
            .unwrap();
        store
            .catalog_put("rule:mem_critical", serde_json::json!({"name": "Memory"}))
            .await
            .unwrap();
        store
            .catalog_put("alert:a-1", serde_json::json!({"status": "active"}))
            .await
            .unwrap();

        let rules = store.catalog_list("rule:").await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|(k, _)| k.starts_with("rule:")));

        assert!(store.catalog_get("alert:a-1").await.unwrap().is_some());
        assert!(store.catalog_delete("alert:a-1").await.unwrap());
        assert!(!store.catalog_delete("alert:a-1").await.unwrap());
    }

    #[tokio::test]
    async fn audit_sequence_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let mut last = 0;
        for i in 0..3 {
            let seq = store
                .audit(AuditEntry {
                    actor: "operator".into(),
                    action: "acknowledge".into(),
                    entity: format!("alert:a-{i}"),
                    detail: String::new(),
                })
                .await
                .unwrap();
            assert!(seq > last);
            last = seq;
        }
        let records = store.audit_list(10).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].seq > records[1].seq, "newest first");
    }

    #[tokio::test]
    async fn purge_deletes_old_rows() {
        let store = Store::open_in_memory().unwrap();
        let mut old = metric_row(1.0);
        old.timestamp = Utc::now() - ChronoDuration::days(30);
        store.append(vec![old, metric_row(2.0)]).await.unwrap();

        let deleted = store
            .purge(RetentionPolicy::uniform(ChronoDuration::days(7)))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let now = Utc::now();
        let result = store
            .query(QuerySpec {
                kind: TelemetryKind::SystemMetrics,
                window: (now - ChronoDuration::days(60), now + ChronoDuration::minutes(1)),
                ..QuerySpec::default_for(TelemetryKind::SystemMetrics)
            })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("argus.db");
        {
            let store = Store::open(&path).unwrap();
            store.append(vec![metric_row(42.0)]).await.unwrap();
        }
        let store = Store::open(&path).unwrap();
        let now = Utc::now();
        let result = store
            .query(QuerySpec {
                kind: TelemetryKind::SystemMetrics,
                window: (now - ChronoDuration::minutes(5), now + ChronoDuration::minutes(1)),
                ..QuerySpec::default_for(TelemetryKind::SystemMetrics)
            })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
    }
}
