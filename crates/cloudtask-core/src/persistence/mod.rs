// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task record store interface and backends.
//!
//! The store owns the durable side of the runtime's guarantees:
//! [`TaskStore::transition`] is a compare-and-set on the stage,
//! [`TaskStore::terminate`] reports whether *this* call moved the task to a
//! terminal stage, and [`TaskStore::record_subtask_result`] reports whether
//! *this* call recorded the child. The runtime keys exactly-once behaviour
//! (quota release, parent signalling) off those booleans.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryTaskStore;
pub use self::sqlite::SqliteTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::CoreError;
use crate::record::{Outcome, TaskRecord};

/// Status of one child in the subtask aggregation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Still running.
    Init,
    /// Terminated `complete`.
    Succeeded,
    /// Terminated `failed`.
    Failed,
}

impl SubtaskStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse a column value; unknown strings read as `Init`.
    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Init,
        }
    }
}

/// One child row of a subtask aggregation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskOutcome {
    /// Child task id.
    pub child_id: String,
    /// Current status.
    pub status: SubtaskStatus,
    /// Child's terminal result once recorded.
    pub result: Option<Value>,
}

/// Aggregation record for the children a parent opened on one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSummary {
    /// Parent task id.
    pub parent_id: String,
    /// Parent stage the children report to.
    pub stage: String,
    /// Children in submission order.
    pub children: Vec<SubtaskOutcome>,
}

impl SubtaskSummary {
    /// Number of children.
    pub fn total(&self) -> usize {
        self.children.len()
    }

    /// Children that terminated `complete`.
    pub fn succeeded(&self) -> usize {
        self.count(SubtaskStatus::Succeeded)
    }

    /// Children that terminated `failed`.
    pub fn failed(&self) -> usize {
        self.count(SubtaskStatus::Failed)
    }

    /// Children still running.
    pub fn pending(&self) -> usize {
        self.count(SubtaskStatus::Init)
    }

    /// True when at least one child failed.
    pub fn any_failed(&self) -> bool {
        self.failed() > 0
    }

    /// Percentage of children that finished, 100 when there are none.
    pub fn progress(&self) -> f32 {
        if self.children.is_empty() {
            return 100.0;
        }
        let done = self.total() - self.pending();
        done as f32 * 100.0 / self.total() as f32
    }

    /// Failed children with their results.
    pub fn failures(&self) -> impl Iterator<Item = &SubtaskOutcome> {
        self.children
            .iter()
            .filter(|c| c.status == SubtaskStatus::Failed)
    }

    /// JSON form handed to the parent's continuation.
    pub fn to_json(&self) -> Value {
        json!({
            "total": self.total(),
            "succeeded": self.succeeded(),
            "failed": self.failed(),
            "children": self.children,
        })
    }

    fn count(&self, status: SubtaskStatus) -> usize {
        self.children.iter().filter(|c| c.status == status).count()
    }
}

/// Filter for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only children of this task.
    pub parent_id: Option<String>,
    /// Only tasks of this kind.
    pub kind: Option<String>,
    /// Only tasks at this stage.
    pub stage: Option<String>,
    /// Only tasks bound to this object id.
    pub object_id: Option<String>,
    /// Only non-terminal tasks.
    pub incomplete_only: bool,
    /// Maximum rows, newest first.
    pub limit: Option<i64>,
}

impl TaskFilter {
    /// Non-terminal children of `parent_id`.
    pub fn incomplete_children(parent_id: &str) -> Self {
        Self {
            parent_id: Some(parent_id.to_string()),
            incomplete_only: true,
            ..Default::default()
        }
    }
}

/// Durable CRUD on task records and subtask aggregation rows.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new record. Fails if the id exists.
    async fn create(&self, record: &TaskRecord) -> Result<(), CoreError>;

    /// Load a record or fail with [`CoreError::TaskNotFound`].
    async fn load(&self, task_id: &str) -> Result<TaskRecord, CoreError>;

    /// Compare-and-set the stage.
    ///
    /// Succeeds only while the record is non-terminal, not cancel-requested
    /// and still at `expected_stage`. Merges `params` (last write wins) and
    /// appends the left stage to the history in the same write.
    async fn transition(
        &self,
        task_id: &str,
        expected_stage: &str,
        new_stage: &str,
        params: Option<&Map<String, Value>>,
    ) -> Result<TaskRecord, CoreError>;

    /// Merge `params` without changing the stage.
    async fn save_params(&self, task_id: &str, params: &Map<String, Value>)
    -> Result<(), CoreError>;

    /// Write the terminal stage and result.
    ///
    /// Returns `true` only for the call that performed the termination.
    async fn terminate(
        &self,
        task_id: &str,
        outcome: Outcome,
        result: &Value,
    ) -> Result<bool, CoreError>;

    /// Stamp the first dispatch time (no-op if already set).
    async fn mark_started(&self, task_id: &str) -> Result<(), CoreError>;

    /// Record the percentage done on a non-terminal task, clamped to
    /// `0..=100`. Terminal tasks keep their final value.
    async fn set_progress(&self, task_id: &str, progress: f32) -> Result<(), CoreError>;

    /// Flag the task for cancellation. Returns `false` if already terminal.
    async fn request_cancel(&self, task_id: &str) -> Result<bool, CoreError>;

    /// List records, newest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, CoreError>;

    /// All non-terminal records.
    async fn list_incomplete(&self) -> Result<Vec<TaskRecord>, CoreError> {
        self.list(&TaskFilter {
            incomplete_only: true,
            ..Default::default()
        })
        .await
    }

    /// Open aggregation rows for children reporting to `parent_stage`.
    async fn register_subtasks(
        &self,
        parent_id: &str,
        parent_stage: &str,
        child_ids: &[String],
    ) -> Result<(), CoreError>;

    /// Record a child's terminal result.
    ///
    /// Returns the updated summary of the child's stage, or `None` when the
    /// child was already recorded (or was never registered).
    async fn record_subtask_result(
        &self,
        parent_id: &str,
        child_id: &str,
        succeeded: bool,
        result: &Value,
    ) -> Result<Option<SubtaskSummary>, CoreError>;

    /// Current aggregation for `(parent_id, parent_stage)`.
    async fn subtask_summary(
        &self,
        parent_id: &str,
        parent_stage: &str,
    ) -> Result<SubtaskSummary, CoreError>;

    /// Delete terminal tasks finished before `cutoff`, at most `limit`.
    ///
    /// Returns the number of tasks removed.
    async fn archive_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError>;

    /// Check store connectivity.
    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}
