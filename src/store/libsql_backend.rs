//! libSQL backend — async `TaskRepository` implementation.
//!
//! Supports local file and in-memory databases. Every statement runs while
//! holding `conn_lock`. Bulk save runs inside an explicit transaction under
//! that lock, so neither writes nor reads from other tasks sharing the
//! connection interleave with an open transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::normalize_labels;
use crate::store::migrations;
use crate::store::traits::TaskRepository;
use crate::tasks::model::{TaskMetrics, TaskPage, TaskPatch, TaskQuery, TaskRecord};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    conn_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            conn_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Caller holds `conn_lock`.
    async fn query_tasks(
        &self,
        sql: &str,
        values: Vec<Value>,
        context: &str,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{context}: {e}"))),
            }
        }
        Ok(tasks)
    }

    async fn rollback(&self) {
        if let Err(e) = self.conn().execute("ROLLBACK", ()).await {
            warn!(error = %e, "Rollback failed");
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, subject, sender, body, external_id, labels, confidence, \
     is_done, is_archived, received_at, created_at, updated_at";

/// Fixed-width UTC timestamps so lexical order matches time order.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("bad task id {id_str}: {e}")))?;
    let labels_json: String = row.get(5).map_err(parse)?;
    let labels: Vec<String> = serde_json::from_str(&labels_json)
        .map_err(|e| DatabaseError::Serialization(format!("bad labels for {id_str}: {e}")))?;
    let received: String = row.get(9).map_err(parse)?;
    let created: String = row.get(10).map_err(parse)?;
    let updated: String = row.get(11).map_err(parse)?;

    Ok(TaskRecord {
        id,
        subject: row.get(1).map_err(parse)?,
        sender: row.get(2).map_err(parse)?,
        body: row.get::<String>(3).unwrap_or_default(),
        external_id: row.get(4).map_err(parse)?,
        labels,
        confidence: row.get::<f64>(6).map_err(parse)?,
        is_done: row.get::<i64>(7).unwrap_or(0) != 0,
        is_archived: row.get::<i64>(8).unwrap_or(0) != 0,
        received_at: parse_datetime(&received),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a write error, recognising uniqueness violations.
fn write_error(context: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") || msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{context}: {msg}"))
    } else {
        DatabaseError::Query(format!("{context}: {msg}"))
    }
}

/// `?start, ?start+1, ...` for `n` positional parameters.
fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn opt_bool(b: Option<bool>) -> Value {
    match b {
        Some(b) => Value::Integer(i64::from(b)),
        None => Value::Null,
    }
}

fn labels_value(labels: &Option<Vec<String>>) -> Result<Value, DatabaseError> {
    match labels {
        Some(labels) => {
            let json = serde_json::to_string(&normalize_labels(labels.clone()))
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            Ok(Value::Text(json))
        }
        None => Ok(Value::Null),
    }
}

/// Escape LIKE wildcards in user input.
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskRepository for LibSqlBackend {
    async fn save(&self, records: &[TaskRecord]) -> Result<Vec<TaskRecord>, DatabaseError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let labels = records
            .iter()
            .map(|r| serde_json::to_string(&r.labels))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let _guard = self.conn_lock.lock().await;
        let conn = self.conn();

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("save: begin: {e}")))?;

        for (record, labels) in records.iter().zip(labels) {
            let result = conn
                .execute(
                    &format!(
                        "INSERT INTO tasks ({TASK_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ),
                    params![
                        record.id.to_string(),
                        record.subject.clone(),
                        record.sender.clone(),
                        record.body.clone(),
                        record.external_id.clone(),
                        labels,
                        record.confidence,
                        i64::from(record.is_done),
                        i64::from(record.is_archived),
                        fmt_ts(&record.received_at),
                        fmt_ts(&record.created_at),
                        fmt_ts(&record.updated_at),
                    ],
                )
                .await;

            if let Err(e) = result {
                self.rollback().await;
                return Err(write_error(
                    &format!("save external_id={}", record.external_id),
                    e,
                ));
            }
        }

        if let Err(e) = conn.execute("COMMIT", ()).await {
            self.rollback().await;
            return Err(write_error("save: commit", e));
        }

        debug!(count = records.len(), "Tasks saved");
        Ok(records.to_vec())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let _guard = self.conn_lock.lock().await;
        let mut tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                vec![Value::Text(id.to_string())],
                "find_by_id",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<TaskRecord>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values = ids.iter().map(|id| Value::Text(id.to_string())).collect();
        let _guard = self.conn_lock.lock().await;
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE id IN ({}) ORDER BY received_at DESC",
                placeholders(1, ids.len())
            ),
            values,
            "find_by_ids",
        )
        .await
    }

    async fn find_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let values = external_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();
        let _guard = self.conn_lock.lock().await;
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE external_id IN ({})",
                placeholders(1, external_ids.len())
            ),
            values,
            "find_by_external_ids",
        )
        .await
    }

    async fn update_by_id(
        &self,
        id: Uuid,
        patch: &TaskPatch,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let updated = self.update_by_ids(&[id], patch).await?;
        if updated == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    async fn update_by_ids(&self, ids: &[Uuid], patch: &TaskPatch) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut values = vec![
            labels_value(&patch.labels)?,
            opt_bool(patch.is_done),
            opt_bool(patch.is_archived),
            Value::Text(fmt_ts(&Utc::now())),
        ];
        values.extend(ids.iter().map(|id| Value::Text(id.to_string())));

        let sql = format!(
            "UPDATE tasks SET
                labels = COALESCE(?1, labels),
                is_done = COALESCE(?2, is_done),
                is_archived = COALESCE(?3, is_archived),
                updated_at = ?4
             WHERE id IN ({})",
            placeholders(5, ids.len())
        );

        let _guard = self.conn_lock.lock().await;
        let updated = self
            .conn()
            .execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| write_error("update_by_ids", e))?;

        debug!(requested = ids.len(), updated, "Tasks updated");
        Ok(updated)
    }

    async fn list(&self, query: &TaskQuery) -> Result<TaskPage, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !query.labels.is_empty() {
            let mut any = Vec::new();
            for label in &query.labels {
                values.push(Value::Text(format!("%\"{}\"%", like_escape(label))));
                any.push(format!("labels LIKE ?{} ESCAPE '\\'", values.len()));
            }
            clauses.push(format!("({})", any.join(" OR ")));
        }

        if let (Some(start), Some(end)) = (query.start, query.end) {
            values.push(Value::Text(fmt_ts(&start)));
            values.push(Value::Text(fmt_ts(&end)));
            clauses.push(format!(
                "received_at BETWEEN ?{} AND ?{}",
                values.len() - 1,
                values.len()
            ));
        }

        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            values.push(Value::Text(format!("%{}%", like_escape(search.trim()))));
            let n = values.len();
            clauses.push(format!(
                "(subject LIKE ?{n} ESCAPE '\\' OR sender LIKE ?{n} ESCAPE '\\' OR body LIKE ?{n} ESCAPE '\\')"
            ));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        // Count and page read under one lock hold.
        let _guard = self.conn_lock.lock().await;
        let total = {
            let mut rows = self
                .conn()
                .query(
                    &format!("SELECT COUNT(*) FROM tasks {where_sql}"),
                    libsql::params_from_iter(values.clone()),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("list count: {e}")))?;
            match rows.next().await {
                Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0).max(0) as u64,
                Ok(None) => 0,
                Err(e) => return Err(DatabaseError::Query(format!("list count: {e}"))),
            }
        };

        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, 500);
        let offset = i64::from(page - 1) * i64::from(page_size);
        values.push(Value::Integer(i64::from(page_size)));
        values.push(Value::Integer(offset));
        let limit_idx = values.len() - 1;

        let tasks = self
            .query_tasks(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks {where_sql}
                     ORDER BY received_at DESC, created_at DESC
                     LIMIT ?{limit_idx} OFFSET ?{}",
                    limit_idx + 1
                ),
                values,
                "list",
            )
            .await?;

        Ok(TaskPage::new(tasks, total, page, page_size))
    }

    async fn count(&self) -> Result<u64, DatabaseError> {
        let _guard = self.conn_lock.lock().await;
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM tasks", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }

    async fn metrics(&self) -> Result<TaskMetrics, DatabaseError> {
        let query_err = |e: libsql::Error| DatabaseError::Query(format!("metrics: {e}"));
        let _guard = self.conn_lock.lock().await;
        let mut rows = self
            .conn()
            .query("SELECT is_done, is_archived, labels FROM tasks", ())
            .await
            .map_err(query_err)?;

        let mut metrics = TaskMetrics::default();
        let mut labels: BTreeMap<String, u64> = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            metrics.total += 1;
            if row.get::<i64>(0).unwrap_or(0) != 0 {
                metrics.done += 1;
            }
            if row.get::<i64>(1).unwrap_or(0) != 0 {
                metrics.archived += 1;
            }
            let raw: String = row.get(2).map_err(query_err)?;
            let task_labels: Vec<String> = serde_json::from_str(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("bad labels: {e}")))?;
            for label in task_labels {
                *labels.entry(label).or_default() += 1;
            }
        }
        metrics.labels = labels;
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Classification, PendingMessage};

    fn task(external_id: &str, labels: &[&str]) -> TaskRecord {
        TaskRecord::from_classified(
            PendingMessage::new(
                format!("Subject {external_id}"),
                format!("{external_id}@example.com"),
                format!("Body for {external_id}"),
                external_id,
            ),
            Classification::new(labels.iter().map(|s| s.to_string()).collect(), 0.8),
        )
    }

    #[tokio::test]
    async fn save_and_find() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let t = task("123", &["general"]);
        let saved = db.save(std::slice::from_ref(&t)).await.unwrap();
        assert_eq!(saved.len(), 1);

        let found = db.find_by_id(t.id).await.unwrap().unwrap();
        assert_eq!(found.external_id, "123");
        assert_eq!(found.labels, vec!["general"]);
        assert_eq!(found.confidence, 0.8);
        assert!(!found.is_done);
        assert_eq!(db.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_external_id_is_a_conflict_and_saves_nothing() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.save(&[task("a", &["x"])]).await.unwrap();

        let err = db
            .save(&[task("b", &["x"]), task("a", &["y"])])
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "expected conflict, got {err}");

        // "b" was rolled back with the rest of the batch.
        assert_eq!(db.count().await.unwrap(), 1);
        assert!(
            db.find_by_external_ids(&["b".to_string()])
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn duplicate_within_one_save_is_a_conflict() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let err = db
            .save(&[task("dup", &["x"]), task("dup", &["y"])])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(db.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_by_ids_skips_missing() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = task("a", &["x"]);
        let b = task("b", &["x"]);
        db.save(&[a.clone(), b.clone()]).await.unwrap();

        let found = db.find_by_ids(&[a.id, Uuid::new_v4()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
    }

    #[tokio::test]
    async fn update_by_id_applies_patch() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let t = task("a", &["x"]);
        db.save(std::slice::from_ref(&t)).await.unwrap();

        let patch = TaskPatch {
            labels: Some(vec!["work".into(), "work".into(), "urgent".into()]),
            is_done: Some(true),
            is_archived: None,
        };
        let updated = db.update_by_id(t.id, &patch).await.unwrap().unwrap();
        assert_eq!(updated.labels, vec!["work", "urgent"]);
        assert!(updated.is_done);
        assert!(!updated.is_archived);
        assert!(updated.updated_at >= t.updated_at);

        assert!(
            db.update_by_id(Uuid::new_v4(), &patch)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn update_by_ids_bulk() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = task("a", &["x"]);
        let b = task("b", &["x"]);
        let c = task("c", &["x"]);
        db.save(&[a.clone(), b.clone(), c.clone()]).await.unwrap();

        let patch = TaskPatch {
            is_archived: Some(true),
            ..TaskPatch::default()
        };
        let n = db.update_by_ids(&[a.id, b.id], &patch).await.unwrap();
        assert_eq!(n, 2);

        let c_now = db.find_by_id(c.id).await.unwrap().unwrap();
        assert!(!c_now.is_archived);
        let a_now = db.find_by_id(a.id).await.unwrap().unwrap();
        assert!(a_now.is_archived);
        assert_eq!(a_now.labels, vec!["x"]);
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let base = Utc::now();
        let mut records = Vec::new();
        for i in 0..5 {
            let mut t = task(&format!("m{i}"), if i % 2 == 0 { &["work"] } else { &["hr"] });
            t.received_at = base - chrono::Duration::minutes(i);
            records.push(t);
        }
        db.save(&records).await.unwrap();

        let page = db
            .list(&TaskQuery {
                page_size: 2,
                ..TaskQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.tasks.len(), 2);
        assert_eq!(page.tasks[0].external_id, "m0");

        let work = db
            .list(&TaskQuery {
                labels: vec!["work".into()],
                ..TaskQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(work.total, 3);

        let search = db
            .list(&TaskQuery {
                search: Some("Body for m3".into()),
                ..TaskQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(search.total, 1);
        assert_eq!(search.tasks[0].external_id, "m3");

        let window = db
            .list(&TaskQuery {
                start: Some(base - chrono::Duration::seconds(90)),
                end: Some(base),
                ..TaskQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(window.total, 2);
    }

    #[tokio::test]
    async fn opens_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/tasks.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.save(&[task("file", &["x"])]).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn metrics_count_status_and_labels() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = task("a", &["work", "urgent"]);
        let b = task("b", &["work"]);
        let c = task("c", &["general"]);
        db.save(&[a.clone(), b.clone(), c]).await.unwrap();
        db.update_by_id(
            a.id,
            &TaskPatch {
                is_done: Some(true),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();
        db.update_by_id(
            b.id,
            &TaskPatch {
                is_archived: Some(true),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

        let m = db.metrics().await.unwrap();
        assert_eq!(m.total, 3);
        assert_eq!(m.done, 1);
        assert_eq!(m.archived, 1);
        assert_eq!(m.labels.get("work"), Some(&2));
        assert_eq!(m.labels.get("urgent"), Some(&1));
        assert_eq!(m.labels.get("general"), Some(&1));
        assert_eq!(m.labels.len(), 3);
    }

    #[tokio::test]
    async fn empty_store_metrics() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert_eq!(db.metrics().await.unwrap(), TaskMetrics::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_never_see_rows_of_a_rolled_back_save() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.save(&[task("taken", &["x"])]).await.unwrap();

        let reader = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    seen.push(db.count().await.unwrap());
                    seen.push(db.list(&TaskQuery::default()).await.unwrap().total);
                    tokio::task::yield_now().await;
                }
                seen
            })
        };

        for round in 0..20 {
            let mut batch: Vec<TaskRecord> =
                (0..16).map(|i| task(&format!("r{round}-{i}"), &["x"])).collect();
            batch.push(task("taken", &["x"]));
            assert!(db.save(&batch).await.unwrap_err().is_conflict());
        }

        let seen = reader.await.unwrap();
        assert!(seen.iter().all(|&n| n == 1), "observed uncommitted rows: {seen:?}");
    }
}
