// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory task store for tests and the sandbox server.
//!
//! Not durable: a process restart loses every record. All operations run
//! under one lock so each call is atomic with respect to the others.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{SubtaskOutcome, SubtaskStatus, SubtaskSummary, TaskFilter, TaskStore};
use crate::error::CoreError;
use crate::record::{Outcome, StageHistoryEntry, TaskRecord};

#[derive(Debug, Clone)]
struct SubtaskRow {
    parent_id: String,
    parent_stage: String,
    child_id: String,
    status: SubtaskStatus,
    result: Option<Value>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskRecord>,
    subtasks: Vec<SubtaskRow>,
}

impl Inner {
    fn get_mut(&mut self, task_id: &str) -> Result<&mut TaskRecord, CoreError> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    fn summary(&self, parent_id: &str, parent_stage: &str) -> SubtaskSummary {
        SubtaskSummary {
            parent_id: parent_id.to_string(),
            stage: parent_stage.to_string(),
            children: self
                .subtasks
                .iter()
                .filter(|r| r.parent_id == parent_id && r.parent_stage == parent_stage)
                .map(|r| SubtaskOutcome {
                    child_id: r.child_id.clone(),
                    status: r.status,
                    result: r.result.clone(),
                })
                .collect(),
        }
    }
}

/// Task store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    /// True when no records are held.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn matches(record: &TaskRecord, filter: &TaskFilter) -> bool {
    if let Some(parent) = &filter.parent_id
        && record.parent_id.as_deref() != Some(parent.as_str())
    {
        return false;
    }
    if let Some(kind) = &filter.kind
        && &record.kind != kind
    {
        return false;
    }
    if let Some(stage) = &filter.stage
        && &record.stage != stage
    {
        return false;
    }
    if let Some(object_id) = &filter.object_id {
        let bound = record
            .object
            .as_ref()
            .is_some_and(|o| o.ids.iter().any(|id| id == object_id));
        if !bound {
            return false;
        }
    }
    !(filter.incomplete_only && record.is_terminal())
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&record.id) {
            return Err(CoreError::DatabaseError {
                operation: "create".to_string(),
                details: format!("task {} already exists", record.id),
            });
        }
        inner.tasks.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<TaskRecord, CoreError> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn transition(
        &self,
        task_id: &str,
        expected_stage: &str,
        new_stage: &str,
        params: Option<&Map<String, Value>>,
    ) -> Result<TaskRecord, CoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.get_mut(task_id)?;

        if record.is_terminal() {
            return Err(CoreError::TaskTerminated {
                task_id: task_id.to_string(),
                stage: record.stage.clone(),
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
                actual: record.stage.clone(),
            });
        }

        let now = Utc::now();
        record.stage_history.push(StageHistoryEntry {
            stage: std::mem::replace(&mut record.stage, new_stage.to_string()),
            completed_at: now,
        });
        if let Some(params) = params {
            record.merge_params(params);
        }
        record.version += 1;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn save_params(
        &self,
        task_id: &str,
        params: &Map<String, Value>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.get_mut(task_id)?;
        record.merge_params(params);
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn terminate(
        &self,
        task_id: &str,
        outcome: Outcome,
        result: &Value,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.get_mut(task_id)?;
        if record.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        record.stage_history.push(StageHistoryEntry {
            stage: std::mem::replace(&mut record.stage, outcome.stage().to_string()),
            completed_at: now,
        });
        record.result = Some(result.clone());
        record.progress = 100.0;
        record.version += 1;
        record.updated_at = now;
        record.finished_at = Some(now);
        Ok(true)
    }

    async fn mark_started(&self, task_id: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.get_mut(task_id)?;
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_progress(&self, task_id: &str, progress: f32) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.get_mut(task_id)?;
        if !record.is_terminal() {
            record.progress = progress.clamp(0.0, 100.0);
            record.version += 1;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn request_cancel(&self, task_id: &str) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.get_mut(task_id)?;
        if record.is_terminal() {
            return Ok(false);
        }
        record.cancel_requested = true;
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, CoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|r| matches(r, filter))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit.max(0) as usize);
        }
        Ok(records)
    }

    async fn register_subtasks(
        &self,
        parent_id: &str,
        parent_stage: &str,
        child_ids: &[String],
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        for child_id in child_ids {
            let exists = inner
                .subtasks
                .iter()
                .any(|r| r.parent_id == parent_id && &r.child_id == child_id);
            if !exists {
                inner.subtasks.push(SubtaskRow {
                    parent_id: parent_id.to_string(),
                    parent_stage: parent_stage.to_string(),
                    child_id: child_id.clone(),
                    status: SubtaskStatus::Init,
                    result: None,
                });
            }
        }
        Ok(())
    }

    async fn record_subtask_result(
        &self,
        parent_id: &str,
        child_id: &str,
        succeeded: bool,
        result: &Value,
    ) -> Result<Option<SubtaskSummary>, CoreError> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.subtasks.iter_mut().find(|r| {
            r.parent_id == parent_id && r.child_id == child_id && r.status == SubtaskStatus::Init
        }) else {
            return Ok(None);
        };

        row.status = if succeeded {
            SubtaskStatus::Succeeded
        } else {
            SubtaskStatus::Failed
        };
        row.result = Some(result.clone());
        let stage = row.parent_stage.clone();
        Ok(Some(inner.summary(parent_id, &stage)))
    }

    async fn subtask_summary(
        &self,
        parent_id: &str,
        parent_stage: &str,
    ) -> Result<SubtaskSummary, CoreError> {
        Ok(self.inner.lock().await.summary(parent_id, parent_stage))
    }

    async fn archive_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let mut inner = self.inner.lock().await;
        let mut expired: Vec<(DateTime<Utc>, String)> = inner
            .tasks
            .values()
            .filter(|r| r.is_terminal() && r.finished_at.is_some_and(|f| f < cutoff))
            .map(|r| (r.finished_at.unwrap_or(cutoff), r.id.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit.max(0) as usize);

        for (_, id) in &expired {
            inner.tasks.remove(id);
            inner.subtasks.retain(|r| &r.parent_id != id);
        }
        Ok(expired.len() as u64)
    }
}
