// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed task store.
//!
//! Record updates are optimistic: each write is guarded by the `version`
//! column read just before it, and retried a bounded number of times when a
//! concurrent writer got there first.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::{SubtaskOutcome, SubtaskStatus, SubtaskSummary, TaskFilter, TaskStore};
use crate::error::CoreError;
use crate::record::{ObjectRef, Outcome, StageHistoryEntry, TaskRecord, UserCred};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const MAX_WRITE_ATTEMPTS: usize = 5;

const TASK_COLUMNS: &str = "id, kind, stage, params, user_cred, object_kind, object_ids, \
     object_name, parent_id, parent_stage, parent_notify_url, pending_usage, cancel_requested, \
     stage_history, progress, result, version, created_at, updated_at, started_at, finished_at";

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    kind: String,
    stage: String,
    params: String,
    user_cred: String,
    object_kind: Option<String>,
    object_ids: String,
    object_name: Option<String>,
    parent_id: Option<String>,
    parent_stage: Option<String>,
    parent_notify_url: Option<String>,
    pending_usage: Option<String>,
    cancel_requested: bool,
    stage_history: String,
    progress: f64,
    result: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let object = match row.object_kind {
            Some(kind) => Some(ObjectRef {
                kind,
                ids: serde_json::from_str(&row.object_ids)?,
                name: row.object_name,
            }),
            None => None,
        };
        Ok(TaskRecord {
            id: row.id,
            kind: row.kind,
            stage: row.stage,
            params: serde_json::from_str(&row.params)?,
            user_cred: serde_json::from_str::<UserCred>(&row.user_cred)?,
            object,
            parent_id: row.parent_id,
            parent_stage: row.parent_stage,
            parent_notify_url: row.parent_notify_url,
            pending_usage: row
                .pending_usage
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            cancel_requested: row.cancel_requested,
            stage_history: serde_json::from_str::<Vec<StageHistoryEntry>>(&row.stage_history)?,
            progress: row.progress as f32,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubtaskRow {
    child_id: String,
    status: String,
    result: Option<String>,
}

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a store from an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations against the pool.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    /// Connect to a SQLite URL and run migrations.
    ///
    /// In-memory URLs get a single connection so every query sees the same
    /// database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write `record` if its stored version still equals `expected_version`.
    async fn write_guarded(
        &self,
        record: &TaskRecord,
        expected_version: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET stage = ?, params = ?, stage_history = ?, progress = ?, result = ?,
                cancel_requested = ?, version = ?, updated_at = ?, finished_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&record.stage)
        .bind(serde_json::to_string(&record.params)?)
        .bind(serde_json::to_string(&record.stage_history)?)
        .bind(f64::from(record.progress))
        .bind(record.result.as_ref().map(Value::to_string))
        .bind(record.cancel_requested)
        .bind(record.version)
        .bind(record.updated_at)
        .bind(record.finished_at)
        .bind(&record.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_summary<'e, E>(
        executor: E,
        parent_id: &str,
        parent_stage: &str,
    ) -> Result<SubtaskSummary, CoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, SubtaskRow>(
            r#"
            SELECT child_id, status, result
            FROM subtasks
            WHERE parent_id = ? AND parent_stage = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(parent_id)
        .bind(parent_stage)
        .fetch_all(executor)
        .await?;

        let children = rows
            .into_iter()
            .map(|r| -> Result<SubtaskOutcome, CoreError> {
                Ok(SubtaskOutcome {
                    child_id: r.child_id,
                    status: SubtaskStatus::parse(&r.status),
                    result: r.result.as_deref().map(serde_json::from_str).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SubtaskSummary {
            parent_id: parent_id.to_string(),
            stage: parent_stage.to_string(),
            children,
        })
    }
}

fn write_conflict(task_id: &str) -> CoreError {
    CoreError::DatabaseError {
        operation: "update".to_string(),
        details: format!("task {} kept changing under concurrent writers", task_id),
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), CoreError> {
        let (object_kind, object_ids, object_name) = match &record.object {
            Some(o) => (
                Some(o.kind.as_str()),
                serde_json::to_string(&o.ids)?,
                o.name.as_deref(),
            ),
            None => (None, "[]".to_string(), None),
        };

        sqlx::query(
            r#"
            INSERT INTO tasks (id, kind, stage, params, user_cred, object_kind, object_ids,
                               object_name, parent_id, parent_stage, parent_notify_url,
                               pending_usage, cancel_requested, stage_history, progress,
                               result, version, created_at, updated_at, started_at,
                               finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.kind)
        .bind(&record.stage)
        .bind(serde_json::to_string(&record.params)?)
        .bind(serde_json::to_string(&record.user_cred)?)
        .bind(object_kind)
        .bind(object_ids)
        .bind(object_name)
        .bind(record.parent_id.as_deref())
        .bind(record.parent_stage.as_deref())
        .bind(record.parent_notify_url.as_deref())
        .bind(record.pending_usage.as_ref().map(Value::to_string))
        .bind(record.cancel_requested)
        .bind(serde_json::to_string(&record.stage_history)?)
        .bind(f64::from(record.progress))
        .bind(record.result.as_ref().map(Value::to_string))
        .bind(record.version)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<TaskRecord, CoreError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        row.try_into()
    }

    async fn transition(
        &self,
        task_id: &str,
        expected_stage: &str,
        new_stage: &str,
        params: Option<&Map<String, Value>>,
    ) -> Result<TaskRecord, CoreError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut record = self.load(task_id).await?;

            if record.is_terminal() {
                return Err(CoreError::TaskTerminated {
                    task_id: task_id.to_string(),
                    stage: record.stage,
                });
            }
            if record.cancel_requested {
                return Err(CoreError::TaskCancelled {
                    task_id: task_id.to_string(),
                });
            }
            if record.stage != expected_stage {
                return Err(CoreError::StageConflict {
                    task_id: task_id.to_string(),
                    expected: expected_stage.to_string(),
                    actual: record.stage,
                });
            }

            let now = Utc::now();
            let previous = record.version;
            record.stage_history.push(StageHistoryEntry {
                stage: std::mem::replace(&mut record.stage, new_stage.to_string()),
                completed_at: now,
            });
            if let Some(params) = params {
                record.merge_params(params);
            }
            record.version += 1;
            record.updated_at = now;

            if self.write_guarded(&record, previous).await? {
                return Ok(record);
            }
            debug!(task_id = %task_id, "Concurrent write during transition, retrying");
        }

        Err(write_conflict(task_id))
    }

    async fn save_params(
        &self,
        task_id: &str,
        params: &Map<String, Value>,
    ) -> Result<(), CoreError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut record = self.load(task_id).await?;
            let previous = record.version;
            record.merge_params(params);
            record.version += 1;
            record.updated_at = Utc::now();

            if self.write_guarded(&record, previous).await? {
                return Ok(());
            }
        }

        Err(write_conflict(task_id))
    }

    async fn terminate(
        &self,
        task_id: &str,
        outcome: Outcome,
        result: &Value,
    ) -> Result<bool, CoreError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut record = self.load(task_id).await?;
            if record.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now();
            let previous = record.version;
            record.stage_history.push(StageHistoryEntry {
                stage: std::mem::replace(&mut record.stage, outcome.stage().to_string()),
                completed_at: now,
            });
            record.result = Some(result.clone());
            record.progress = 100.0;
            record.version += 1;
            record.updated_at = now;
            record.finished_at = Some(now);

            if self.write_guarded(&record, previous).await? {
                return Ok(true);
            }
        }

        Err(write_conflict(task_id))
    }

    async fn mark_started(&self, task_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET started_at = ?
            WHERE id = ? AND started_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_progress(&self, task_id: &str, progress: f32) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET progress = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND stage NOT IN ('complete', 'failed')
            "#,
        )
        .bind(f64::from(progress.clamp(0.0, 100.0)))
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.load(task_id).await?;
        }
        Ok(())
    }

    async fn request_cancel(&self, task_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET cancel_requested = 1, version = version + 1, updated_at = ?
            WHERE id = ? AND stage NOT IN ('complete', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish "terminal" from "missing".
        self.load(task_id).await?;
        Ok(false)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, CoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS));

        if let Some(parent_id) = &filter.parent_id {
            qb.push(" AND parent_id = ").push_bind(parent_id.clone());
        }
        if let Some(kind) = &filter.kind {
            qb.push(" AND kind = ").push_bind(kind.clone());
        }
        if let Some(stage) = &filter.stage {
            qb.push(" AND stage = ").push_bind(stage.clone());
        }
        if let Some(object_id) = &filter.object_id {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(tasks.object_ids) WHERE value = ")
                .push_bind(object_id.clone())
                .push(")");
        }
        if filter.incomplete_only {
            qb.push(" AND stage NOT IN ('complete', 'failed')");
        }
        qb.push(" ORDER BY created_at DESC, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build_query_as::<TaskRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn register_subtasks(
        &self,
        parent_id: &str,
        parent_stage: &str,
        child_ids: &[String],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for child_id in child_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO subtasks (parent_id, parent_stage, child_id, status, created_at)
                VALUES (?, ?, ?, 'init', ?)
                "#,
            )
            .bind(parent_id)
            .bind(parent_stage)
            .bind(child_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_subtask_result(
        &self,
        parent_id: &str,
        child_id: &str,
        succeeded: bool,
        result: &Value,
    ) -> Result<Option<SubtaskSummary>, CoreError> {
        let status = if succeeded {
            SubtaskStatus::Succeeded
        } else {
            SubtaskStatus::Failed
        };

        // Write first so the transaction holds the write lock before reading.
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE subtasks
            SET status = ?, result = ?
            WHERE parent_id = ? AND child_id = ? AND status = 'init'
            "#,
        )
        .bind(status.as_str())
        .bind(result.to_string())
        .bind(parent_id)
        .bind(child_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let stage: String = sqlx::query_scalar(
            "SELECT parent_stage FROM subtasks WHERE parent_id = ? AND child_id = ?",
        )
        .bind(parent_id)
        .bind(child_id)
        .fetch_one(&mut *tx)
        .await?;

        let summary = Self::fetch_summary(&mut *tx, parent_id, &stage).await?;
        tx.commit().await?;
        Ok(Some(summary))
    }

    async fn subtask_summary(
        &self,
        parent_id: &str,
        parent_stage: &str,
    ) -> Result<SubtaskSummary, CoreError> {
        Self::fetch_summary(&self.pool, parent_id, parent_stage).await
    }

    async fn archive_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE stage IN ('complete', 'failed') AND finished_at < ?
            ORDER BY finished_at, id
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for id in &ids {
            sqlx::query("DELETE FROM subtasks WHERE parent_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(ids.len() as u64)
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::STAGE_FAILED;
    use serde_json::json;

    async fn test_store() -> SqliteTaskStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        let store = SqliteTaskStore::new(pool);
        store.migrate().await.expect("Failed to run migrations");
        store
    }

    fn sample_record() -> TaskRecord {
        let mut record = TaskRecord::new("DnsZoneCreateTask");
        record.object = Some(ObjectRef::single("dns_zone", "zone-1").named("example.test"));
        record.user_cred = UserCred::new("alice", "proj-1").with_token("tok");
        record.params.insert("ttl".to_string(), json!(300));
        record.pending_usage = Some(json!({"dns_zone": 1}));
        record
    }

    #[tokio::test]
    async fn test_create_and_load_roundtrip() {
        let store = test_store().await;
        let record = sample_record();
        store.create(&record).await.unwrap();

        let loaded = store.load(&record.id).await.unwrap();
        assert_eq!(loaded.kind, "DnsZoneCreateTask");
        assert_eq!(loaded.stage, "init");
        assert_eq!(loaded.object, record.object);
        assert_eq!(loaded.user_cred.token, "tok");
        assert_eq!(loaded.params["ttl"], json!(300));
        assert_eq!(loaded.pending_usage, Some(json!({"dns_zone": 1})));
    }

    #[tokio::test]
    async fn test_load_not_found() {
        let store = test_store().await;
        let err = store.load("missing").await.unwrap_err();
        assert_eq!(err.error_code(), "TASK_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_transition_merges_params_and_history() {
        let store = test_store().await;
        let record = sample_record();
        store.create(&record).await.unwrap();

        let mut params = Map::new();
        params.insert("ttl".to_string(), json!(600));
        params.insert("external_id".to_string(), json!("z-1"));
        let updated = store
            .transition(&record.id, "init", "OnZoneReady", Some(&params))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let loaded = store.load(&record.id).await.unwrap();
        assert_eq!(loaded.stage, "OnZoneReady");
        assert_eq!(loaded.params["ttl"], json!(600));
        assert_eq!(loaded.params["external_id"], json!("z-1"));
        assert_eq!(loaded.stage_history.len(), 1);
        assert_eq!(loaded.stage_history[0].stage, "init");

        let err = store
            .transition(&record.id, "init", "OnOther", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StageConflict { .. }));
    }

    #[tokio::test]
    async fn test_terminate_only_once() {
        let store = test_store().await;
        let record = sample_record();
        store.create(&record).await.unwrap();

        let applied = store
            .terminate(&record.id, Outcome::Failed, &json!({"__reason__": "boom"}))
            .await
            .unwrap();
        assert!(applied);
        let again = store
            .terminate(&record.id, Outcome::Complete, &json!({}))
            .await
            .unwrap();
        assert!(!again);

        let loaded = store.load(&record.id).await.unwrap();
        assert_eq!(loaded.stage, STAGE_FAILED);
        assert_eq!(loaded.result, Some(json!({"__reason__": "boom"})));

        let err = store
            .transition(&record.id, STAGE_FAILED, "OnX", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TaskTerminated { .. }));
    }

    #[tokio::test]
    async fn test_progress_and_notify_url_persist() {
        let store = test_store().await;
        let mut record = sample_record();
        record.parent_notify_url = Some("http://region-2.test/tasks/p-9".to_string());
        store.create(&record).await.unwrap();

        store.set_progress(&record.id, 40.0).await.unwrap();
        let loaded = store.load(&record.id).await.unwrap();
        assert_eq!(loaded.progress, 40.0);
        assert_eq!(
            loaded.parent_notify_url.as_deref(),
            Some("http://region-2.test/tasks/p-9")
        );

        store
            .terminate(&record.id, Outcome::Complete, &json!({}))
            .await
            .unwrap();
        assert_eq!(store.load(&record.id).await.unwrap().progress, 100.0);

        // Terminal records keep their final progress.
        store.set_progress(&record.id, 10.0).await.unwrap();
        assert_eq!(store.load(&record.id).await.unwrap().progress, 100.0);
        assert!(store.set_progress("missing", 10.0).await.is_err());
    }

    #[tokio::test]
    async fn test_request_cancel() {
        let store = test_store().await;
        let record = sample_record();
        store.create(&record).await.unwrap();

        assert!(store.request_cancel(&record.id).await.unwrap());
        assert!(store.load(&record.id).await.unwrap().cancel_requested);

        store
            .terminate(&record.id, Outcome::Failed, &json!({}))
            .await
            .unwrap();
        assert!(!store.request_cancel(&record.id).await.unwrap());
        assert!(store.request_cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_list_with_filters() {
        let store = test_store().await;
        let parent = sample_record();
        store.create(&parent).await.unwrap();

        for guest in ["g-1", "g-2"] {
            let mut child = TaskRecord::new("GuestSyncstatusTask");
            child.object = Some(ObjectRef::single("guest", guest));
            child.parent_id = Some(parent.id.clone());
            child.parent_stage = Some("OnGuestsSynced".to_string());
            store.create(&child).await.unwrap();
        }

        let children = store
            .list(&TaskFilter::incomplete_children(&parent.id))
            .await
            .unwrap();
        assert_eq!(children.len(), 2);

        let by_object = store
            .list(&TaskFilter {
                object_id: Some("g-2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_object.len(), 1);

        let by_kind = store
            .list(&TaskFilter {
                kind: Some("DnsZoneCreateTask".to_string()),
                limit: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].id, parent.id);
    }

    #[tokio::test]
    async fn test_subtask_aggregation() {
        let store = test_store().await;
        let children: Vec<String> = vec!["c1".into(), "c2".into(), "c3".into()];
        store
            .register_subtasks("p", "OnProvidersDeleted", &children)
            .await
            .unwrap();

        store
            .record_subtask_result("p", "c1", true, &json!({"id": "c1"}))
            .await
            .unwrap()
            .unwrap();
        let second = store
            .record_subtask_result("p", "c2", false, &json!({"__reason__": "auth denied"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.pending(), 1);

        // Duplicate signal from the same child is ignored.
        let dup = store
            .record_subtask_result("p", "c2", false, &json!({}))
            .await
            .unwrap();
        assert!(dup.is_none());

        let last = store
            .record_subtask_result("p", "c3", true, &json!(null))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.pending(), 0);
        assert_eq!(last.succeeded(), 2);
        assert_eq!(last.failed(), 1);
        assert_eq!(last.children[0].child_id, "c1");

        let summary = store.subtask_summary("p", "OnProvidersDeleted").await.unwrap();
        assert_eq!(summary, last);
    }

    #[tokio::test]
    async fn test_archive_terminal_before() {
        let store = test_store().await;
        let done = sample_record();
        let active = sample_record();
        store.create(&done).await.unwrap();
        store.create(&active).await.unwrap();
        store
            .terminate(&done.id, Outcome::Complete, &json!({}))
            .await
            .unwrap();
        store
            .register_subtasks(&done.id, "OnX", &["c".to_string()])
            .await
            .unwrap();

        let removed = store
            .archive_terminal_before(Utc::now() + chrono::Duration::seconds(5), 100)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&done.id).await.is_err());
        assert!(store.load(&active.id).await.is_ok());
        let summary = store.subtask_summary(&done.id, "OnX").await.unwrap();
        assert_eq!(summary.total(), 0);
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");
        let store = SqliteTaskStore::from_path(&path).await.unwrap();
        assert!(store.health_check().await.unwrap());
        assert!(path.exists());
    }
}
