//! The rusqlite-backed database owned by the store actor thread.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::catalog::{AuditEntry, AuditRecord};
use crate::error::StoreError;
use crate::telemetry::{
    Agg, AggregateRow, AggregateSpec, Order, QueryResult, QuerySpec, RetentionPolicy, Row,
    TelemetryKind,
};
use crate::Command;

pub(crate) struct Database {
    conn: Connection,
}

impl Database {
    pub(crate) fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        // Seven telemetry tables share one column shape; the catalog is a
        // prefix-indexed key/value table; the audit log is append-only.
        let mut schema = String::new();
        for kind in TelemetryKind::ALL {
            let table = kind.table();
            schema.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant TEXT NOT NULL DEFAULT '',
                    ts_ms INTEGER NOT NULL,
                    source TEXT NOT NULL,
                    name TEXT NOT NULL,
                    value REAL,
                    text TEXT,
                    attrs TEXT NOT NULL DEFAULT '{{}}'
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table}(ts_ms);
                CREATE INDEX IF NOT EXISTS idx_{table}_name_ts ON {table}(name, ts_ms);
                "#
            ));
        }
        schema.push_str(
            r#"
            CREATE TABLE IF NOT EXISTS catalog (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                entity TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT ''
            );
            "#,
        );
        self.conn.execute_batch(&schema)?;
        Ok(())
    }

    /// Dispatch one command and reply. Reply send failures mean the
    /// caller gave up (deadline or shutdown); the work is already done.
    pub(crate) fn handle(&mut self, command: Command) {
        match command {
            Command::Append { rows, reply } => {
                let _ = reply.send(self.append(rows));
            }
            Command::Query { spec, reply } => {
                let _ = reply.send(self.query(&spec));
            }
            Command::Aggregate { spec, reply } => {
                let _ = reply.send(self.aggregate(&spec));
            }
            Command::Purge { retention, reply } => {
                let _ = reply.send(self.purge(&retention));
            }
            Command::CatalogPut { key, value, reply } => {
                let _ = reply.send(self.catalog_put(&key, &value));
            }
            Command::CatalogGet { key, reply } => {
                let _ = reply.send(self.catalog_get(&key));
            }
            Command::CatalogList { prefix, reply } => {
                let _ = reply.send(self.catalog_list(&prefix));
            }
            Command::CatalogDelete { key, reply } => {
                let _ = reply.send(self.catalog_delete(&key));
            }
            Command::AuditAppend { entry, reply } => {
                let _ = reply.send(self.audit_append(&entry));
            }
            Command::AuditList { limit, reply } => {
                let _ = reply.send(self.audit_list(limit));
            }
        }
    }

    fn append(&mut self, rows: Vec<Row>) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        for row in &rows {
            let sql = format!(
                "INSERT INTO {} (tenant, ts_ms, source, name, value, text, attrs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                row.kind.table()
            );
            tx.execute(
                &sql,
                params![
                    row.tenant,
                    row.timestamp.timestamp_millis(),
                    row.source,
                    row.name,
                    row.value,
                    row.text,
                    row.attrs.to_string(),
                ],
            )?;
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    fn query(&self, spec: &QuerySpec) -> Result<QueryResult, StoreError> {
        let (start, end) = spec.window;
        if end < start {
            return Err(StoreError::InvalidQuery("window end before start".into()));
        }

        let mut sql = format!(
            "SELECT tenant, ts_ms, source, name, value, text, attrs FROM {}
             WHERE ts_ms >= ?1 AND ts_ms < ?2",
            spec.kind.table()
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(start.timestamp_millis()),
            Box::new(end.timestamp_millis()),
        ];
        if let Some(name) = &spec.name {
            args.push(Box::new(name.clone()));
            sql.push_str(&format!(" AND name = ?{}", args.len()));
        }
        if let Some(prefix) = &spec.name_prefix {
            args.push(Box::new(format!("{}%", escape_like(prefix))));
            sql.push_str(&format!(" AND name LIKE ?{} ESCAPE '\\'", args.len()));
        }
        if let Some(source) = &spec.source {
            args.push(Box::new(source.clone()));
            sql.push_str(&format!(" AND source = ?{}", args.len()));
        }
        if let Some(tenant) = &spec.tenant {
            args.push(Box::new(tenant.clone()));
            sql.push_str(&format!(" AND tenant = ?{}", args.len()));
        }
        if let Some(needle) = &spec.text_contains {
            args.push(Box::new(format!("%{}%", escape_like(needle))));
            sql.push_str(&format!(" AND text LIKE ?{} ESCAPE '\\'", args.len()));
        }
        sql.push_str(match spec.order {
            Order::Asc => " ORDER BY ts_ms ASC",
            Order::Desc => " ORDER BY ts_ms DESC",
        });
        // Fetch one extra row to detect truncation.
        sql.push_str(&format!(" LIMIT {}", spec.limit.saturating_add(1)));

        let mut stmt = self.conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
        let mut rows = Vec::new();
        let mut fetched = stmt.query(params)?;
        while let Some(r) = fetched.next()? {
            rows.push(read_row(spec.kind, r)?);
        }
        let truncated = rows.len() > spec.limit;
        rows.truncate(spec.limit);
        Ok(QueryResult { rows, truncated })
    }

    fn aggregate(&self, spec: &AggregateSpec) -> Result<Vec<AggregateRow>, StoreError> {
        let (start, end) = spec.window;
        if end < start {
            return Err(StoreError::InvalidQuery("window end before start".into()));
        }
        if spec.bucket_s == 0 {
            return Err(StoreError::InvalidQuery("zero bucket width".into()));
        }

        let mut sql = format!(
            "SELECT ts_ms, source, value FROM {} WHERE ts_ms >= ?1 AND ts_ms < ?2",
            spec.kind.table()
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(start.timestamp_millis()),
            Box::new(end.timestamp_millis()),
        ];
        if let Some(name) = &spec.name {
            args.push(Box::new(name.clone()));
            sql.push_str(&format!(" AND name = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY ts_ms ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
        let bucket_ms = (spec.bucket_s as i64) * 1000;
        let start_ms = start.timestamp_millis();

        // (bucket_start_ms, group) -> values; insertion-ordered.
        let mut buckets: Vec<((i64, String), Vec<f64>)> = Vec::new();
        let mut fetched = stmt.query(params)?;
        while let Some(r) = fetched.next()? {
            let ts_ms: i64 = r.get(0)?;
            let source: String = r.get(1)?;
            let value: Option<f64> = r.get(2)?;
            let Some(value) = value else { continue };
            let bucket = start_ms + ((ts_ms - start_ms) / bucket_ms) * bucket_ms;
            let group = if spec.group_by_source {
                source
            } else {
                String::new()
            };
            let key = (bucket, group);
            match buckets.iter_mut().find(|(k, _)| *k == key) {
                Some((_, values)) => values.push(value),
                None => buckets.push((key, vec![value])),
            }
        }

        Ok(buckets
            .into_iter()
            .map(|((bucket_ms, group), mut values)| {
                values.sort_by(|a, b| a.total_cmp(b));
                let computed = spec
                    .aggs
                    .iter()
                    .map(|agg| (*agg, compute_agg(*agg, &values)))
                    .collect();
                AggregateRow {
                    bucket: ms_to_datetime(bucket_ms),
                    group,
                    values: computed,
                }
            })
            .collect())
    }

    fn purge(&mut self, retention: &RetentionPolicy) -> Result<u64, StoreError> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;
        let mut deleted: u64 = 0;
        for kind in TelemetryKind::ALL {
            let cutoff = (now - retention.max_age(kind)).timestamp_millis();
            let sql = format!("DELETE FROM {} WHERE ts_ms < ?1", kind.table());
            deleted += tx.execute(&sql, params![cutoff])? as u64;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn catalog_put(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO catalog (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                           updated_at_ms = excluded.updated_at_ms",
            params![key, value.to_string(), Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn catalog_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM catalog WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn catalog_list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM catalog WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
        )?;
        let pattern = format!("{}%", escape_like(prefix));
        let mut out = Vec::new();
        let mut rows = stmt.query(params![pattern])?;
        while let Some(r) = rows.next()? {
            let key: String = r.get(0)?;
            let raw: String = r.get(1)?;
            out.push((key, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    fn catalog_delete(&self, key: &str) -> Result<bool, StoreError> {
        let affected = self
            .conn
            .execute("DELETE FROM catalog WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    fn audit_append(&self, entry: &AuditEntry) -> Result<u64, StoreError> {
        self.conn.execute(
            "INSERT INTO audit_log (ts_ms, actor, action, entity, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Utc::now().timestamp_millis(),
                entry.actor,
                entry.action,
                entry.entity,
                entry.detail,
            ],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    fn audit_list(&self, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, ts_ms, actor, action, entity, detail FROM audit_log
             ORDER BY seq DESC LIMIT ?1",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![limit as i64])?;
        while let Some(r) = rows.next()? {
            out.push(AuditRecord {
                seq: r.get::<_, i64>(0)? as u64,
                timestamp: ms_to_datetime(r.get(1)?),
                actor: r.get(2)?,
                action: r.get(3)?,
                entity: r.get(4)?,
                detail: r.get(5)?,
            });
        }
        Ok(out)
    }
}

fn read_row(kind: TelemetryKind, r: &rusqlite::Row<'_>) -> Result<Row, StoreError> {
    let attrs_raw: String = r.get(6)?;
    Ok(Row {
        kind,
        tenant: r.get(0)?,
        timestamp: ms_to_datetime(r.get(1)?),
        source: r.get(2)?,
        name: r.get(3)?,
        value: r.get(4)?,
        text: r.get(5)?,
        attrs: serde_json::from_str(&attrs_raw)?,
    })
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Escape `%`, `_`, and the escape character itself for LIKE patterns.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn compute_agg(agg: Agg, sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    match agg {
        Agg::Avg => sorted.iter().sum::<f64>() / sorted.len() as f64,
        Agg::Min => sorted[0],
        Agg::Max => sorted[sorted.len() - 1],
        Agg::Count => sorted.len() as f64,
        Agg::P50 => percentile(sorted, 0.50),
        Agg::P95 => percentile(sorted, 0.95),
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("a%b_c"), "a\\%b\\_c");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn schema_initializes_all_tables() {
        let db = Database::open_in_memory().unwrap();
        for kind in TelemetryKind::ALL {
            let count: i64 = db
                .conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {}", kind.table()),
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn aggregate_computes_percentiles() {
        let mut db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let rows: Vec<Row> = (1..=100)
            .map(|i| Row {
                kind: TelemetryKind::SystemMetrics,
                tenant: String::new(),
                timestamp: now,
                source: "web-1".into(),
                name: "cpu.percent".into(),
                value: Some(i as f64),
                text: None,
                attrs: serde_json::json!({}),
            })
            .collect();
        db.append(rows).unwrap();

        let out = db
            .aggregate(&AggregateSpec {
                kind: TelemetryKind::SystemMetrics,
                window: (now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1)),
                bucket_s: 300,
                name: Some("cpu.percent".into()),
                group_by_source: false,
                aggs: vec![Agg::Avg, Agg::Min, Agg::Max, Agg::Count, Agg::P50, Agg::P95],
            })
            .unwrap();
        assert_eq!(out.len(), 1);
        let values: std::collections::HashMap<_, _> =
            out[0].values.iter().cloned().collect();
        assert_eq!(values[&Agg::Min], 1.0);
        assert_eq!(values[&Agg::Max], 100.0);
        assert_eq!(values[&Agg::Count], 100.0);
        assert_eq!(values[&Agg::Avg], 50.5);
        assert_eq!(values[&Agg::P50], 50.0);
        assert_eq!(values[&Agg::P95], 95.0);
    }
}
