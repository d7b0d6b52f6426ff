// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler-facing task context.
//!
//! A [`TaskContext`] is handed by value to every stage handler. It exposes
//! the bound objects and parameters, the stage transitions, the request
//! header for outbound calls, child submission and the capability ports.
//!
//! Work a handler asks for through [`TaskContext::schedule_run`],
//! [`TaskContext::run_local`] or child submission is queued and started only
//! after the handler returns and the task's locks are released.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatcher::{Deferred, default_result};
use crate::error::{CoreError, TaskError};
use crate::persistence::SubtaskSummary;
use crate::ports::{
    ActionLogEntry, LockPort, NotificationPort, NotifyEvent, OpsLogEntry, QuotaPort, Resource,
    ResourcePort,
};
use crate::record::{INIT_STAGE, Outcome, Payload, TaskRecord, UserCred};
use crate::runtime::{RuntimeInner, TaskSubmission};

/// Header carrying the caller's token.
pub const HEADER_AUTH_TOKEN: &str = "X-Auth-Token";
/// Header carrying the acting user.
pub const HEADER_USER_ID: &str = "X-User-Id";
/// Header carrying the acting project.
pub const HEADER_PROJECT_ID: &str = "X-Project-Id";
/// Header naming the task a callback belongs to.
pub const HEADER_TASK_ID: &str = "X-Task-Id";
/// Header naming the stage a callback resumes.
pub const HEADER_TASK_STAGE: &str = "X-Task-Stage";
/// Header with the URL a remote worker posts its result to.
pub const HEADER_TASK_NOTIFY_URL: &str = "X-Task-Notify-Url";

/// Everything a stage handler can see and do.
pub struct TaskContext {
    runtime: Arc<RuntimeInner>,
    record: TaskRecord,
    objects: Vec<Resource>,
    locks: Arc<dyn LockPort>,
    deferred: mpsc::UnboundedSender<Deferred>,
    terminated: bool,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.record.id)
            .field("kind", &self.record.kind)
            .field("stage", &self.record.stage)
            .field("objects", &self.objects.len())
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        record: TaskRecord,
        objects: Vec<Resource>,
        locks: Arc<dyn LockPort>,
        deferred: mpsc::UnboundedSender<Deferred>,
    ) -> Self {
        Self {
            runtime,
            record,
            objects,
            locks,
            deferred,
            terminated: false,
        }
    }

    /// Task id.
    pub fn task_id(&self) -> &str {
        &self.record.id
    }

    /// Kind name.
    pub fn kind(&self) -> &str {
        &self.record.kind
    }

    /// Current stage as stored.
    pub fn stage(&self) -> &str {
        &self.record.stage
    }

    /// Snapshot of the record as of the last write through this context.
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    /// Caller identity.
    pub fn user_cred(&self) -> &UserCred {
        &self.record.user_cred
    }

    /// Whether this handler already terminated the task.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    // ========================================================================
    // Parameters and objects
    // ========================================================================

    /// Creation parameters plus scratch data saved by earlier stages.
    pub fn params(&self) -> &Map<String, Value> {
        &self.record.params
    }

    /// String parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.record.params.get(key).and_then(Value::as_str)
    }

    /// Boolean parameter; accepts `true` and `"true"`.
    pub fn param_bool(&self, key: &str) -> bool {
        match self.record.params.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Typed parameter; `Ok(None)` when absent.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, TaskError> {
        match self.record.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| TaskError::validation(format!("parameter '{}': {}", key, e))),
        }
    }

    /// The primary bound object.
    pub fn object(&self) -> Result<&Resource, TaskError> {
        self.objects
            .first()
            .ok_or_else(|| TaskError::validation(format!("task {} has no object", self.record.id)))
    }

    /// All bound objects, in submission order.
    pub fn objects(&self) -> &[Resource] {
        &self.objects
    }

    /// Re-read the primary object from the resource port.
    pub async fn reload_object(&mut self) -> Result<&Resource, TaskError> {
        let (kind, id) = {
            let current = self.object()?;
            (current.kind.clone(), current.id.clone())
        };
        let fresh = self
            .runtime
            .resources
            .fetch(&kind, &id)
            .await?
            .ok_or_else(|| TaskError::not_found(format!("fail to find {} object {}", kind, id)))?;
        self.objects[0] = fresh;
        Ok(&self.objects[0])
    }

    // ========================================================================
    // Stage transitions
    // ========================================================================

    /// Move the task to `stage`, merging `params` into the record.
    ///
    /// Fails if the task was cancelled meanwhile; the task is then
    /// terminated as cancelled and the handler should return the error.
    pub async fn set_stage(
        &mut self,
        stage: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<(), TaskError> {
        self.ensure_active()?;
        let result = self
            .runtime
            .store
            .transition(&self.record.id, &self.record.stage, stage, params.as_ref())
            .await;

        match result {
            Ok(updated) => {
                debug!(
                    task_id = %self.record.id,
                    from = %self.record.stage,
                    to = %stage,
                    "Stage transition"
                );
                self.record = updated;
                Ok(())
            }
            Err(CoreError::TaskCancelled { .. }) => Err(self.terminate_cancelled(stage).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge `params` into the record without changing the stage.
    pub async fn save_params(&mut self, params: Map<String, Value>) -> Result<(), TaskError> {
        self.runtime
            .store
            .save_params(&self.record.id, &params)
            .await?;
        self.record.merge_params(&params);
        Ok(())
    }

    /// Terminate the task successfully.
    ///
    /// Without data the result names the bound object. A cancel request
    /// that arrived meanwhile wins and the task ends cancelled.
    pub async fn set_stage_complete(&mut self, data: Option<Value>) -> Result<(), TaskError> {
        self.ensure_active()?;
        let current = self.runtime.store.load(&self.record.id).await?;
        if current.cancel_requested {
            return Err(self.terminate_cancelled("complete").await?);
        }

        let result = match data {
            Some(v) if !v.is_null() => v,
            _ => default_result(&self.record),
        };
        self.runtime
            .finish(&self.record, Outcome::Complete, result)
            .await?;
        self.terminated = true;
        Ok(())
    }

    /// Terminate the task as failed with `err`.
    ///
    /// Calling this on an already terminated context is a no-op.
    pub async fn set_stage_failed(&mut self, err: TaskError) -> Result<(), TaskError> {
        if self.terminated {
            return Ok(());
        }
        self.runtime
            .finish_failed(&self.record, self.record.handler_stage(), err)
            .await?;
        self.terminated = true;
        Ok(())
    }

    async fn terminate_cancelled(&mut self, at: &str) -> Result<TaskError, TaskError> {
        let err = TaskError::cancelled(format!(
            "task {} cancelled before {}",
            self.record.id, at
        ));
        self.runtime
            .finish_failed(&self.record, self.record.handler_stage(), err.clone())
            .await?;
        self.terminated = true;
        Ok(err)
    }

    fn ensure_active(&self) -> Result<(), TaskError> {
        if self.terminated {
            return Err(TaskError::internal(format!(
                "task {} is already terminated",
                self.record.id
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Outbound calls and continuation
    // ========================================================================

    /// Header map attached to outbound calls of the current stage.
    ///
    /// Carries the caller identity and the task coordinates a remote
    /// worker echoes back when it posts its result.
    pub fn request_header(&self) -> BTreeMap<String, String> {
        let cred = &self.record.user_cred;
        let mut header = BTreeMap::new();
        if !cred.token.is_empty() {
            header.insert(HEADER_AUTH_TOKEN.to_string(), cred.token.clone());
        }
        header.insert(HEADER_USER_ID.to_string(), cred.user_id.clone());
        header.insert(HEADER_PROJECT_ID.to_string(), cred.project_id.clone());
        header.insert(HEADER_TASK_ID.to_string(), self.record.id.clone());
        header.insert(HEADER_TASK_STAGE.to_string(), self.record.stage.clone());
        if let Some(url) = &self.runtime.service_url {
            header.insert(
                HEADER_TASK_NOTIFY_URL.to_string(),
                format!("{}/tasks/{}", url.trim_end_matches('/'), self.record.id),
            );
        }
        header
    }

    /// Deliver `payload` to the current stage once this handler returns.
    ///
    /// Used when an outbound call finished synchronously and no callback
    /// will arrive.
    pub fn schedule_run(&self, payload: Payload) {
        self.defer(Deferred::Dispatch {
            task_id: self.record.id.clone(),
            payload,
            expected_stage: Some(self.record.stage.clone()),
        });
    }

    /// Run `job` in the background and continue at `stage` with its outcome.
    ///
    /// Moves the task to `stage` first. Once this handler returns, `job`
    /// runs without a dispatch permit and without the task's locks;
    /// `Ok(data)` then dispatches the `stage` handler and `Err` the
    /// `stage + "Failed"` handler. Bounded remote waits belong here. A
    /// cancel request aborts the job.
    pub async fn run_local<F>(&mut self, stage: &str, job: F) -> Result<(), TaskError>
    where
        F: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.ensure_active()?;
        if self.record.stage != stage {
            self.set_stage(stage, None).await?;
        }
        self.defer(Deferred::Local {
            task_id: self.record.id.clone(),
            stage: stage.to_string(),
            job: Box::pin(job),
        });
        Ok(())
    }

    fn defer(&self, deferred: Deferred) {
        if self.deferred.send(deferred).is_err() {
            warn!(task_id = %self.record.id, "Dispatcher gone, deferred work dropped");
        }
    }

    // ========================================================================
    // Child tasks
    // ========================================================================

    /// Submit one child reporting to `stage`.
    pub async fn submit_child(
        &mut self,
        stage: &str,
        child: TaskSubmission,
    ) -> Result<String, TaskError> {
        let mut ids = self.submit_children(stage, vec![child]).await?;
        ids.pop()
            .ok_or_else(|| TaskError::internal("child submission returned no id"))
    }

    /// Submit children reporting to `stage`.
    ///
    /// Moves the task to `stage` first. The handler for `stage` runs once,
    /// after the last child terminated. With no children nothing is
    /// submitted and the caller must finish the stage itself.
    pub async fn submit_children(
        &mut self,
        stage: &str,
        children: Vec<TaskSubmission>,
    ) -> Result<Vec<String>, TaskError> {
        self.ensure_active()?;
        if self.record.stage != stage {
            self.set_stage(stage, None).await?;
        }
        if children.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(children.len());
        for child in children {
            let child = child.parent(self.record.id.clone(), stage);
            records.push(
                self.runtime
                    .prepare(child, Some(&self.record.user_cred))?,
            );
        }

        for record in &records {
            self.runtime.store.create(record).await?;
        }
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.runtime
            .store
            .register_subtasks(&self.record.id, stage, &ids)
            .await?;

        debug!(
            task_id = %self.record.id,
            stage = %stage,
            children = ids.len(),
            "Submitted subtasks"
        );
        for id in &ids {
            self.defer(Deferred::Dispatch {
                task_id: id.clone(),
                payload: Payload::empty(),
                expected_stage: Some(INIT_STAGE.to_string()),
            });
        }
        Ok(ids)
    }

    /// Submit a task that runs independently of this one.
    pub async fn submit_detached(&self, task: TaskSubmission) -> Result<String, TaskError> {
        let mut task = task;
        task.parent = None;
        let record = self
            .runtime
            .prepare(task, Some(&self.record.user_cred))?;
        self.runtime.store.create(&record).await?;
        debug!(task_id = %self.record.id, detached = %record.id, "Submitted detached task");
        self.defer(Deferred::Dispatch {
            task_id: record.id.clone(),
            payload: Payload::empty(),
            expected_stage: Some(INIT_STAGE.to_string()),
        });
        Ok(record.id)
    }

    /// Children reporting to the current stage.
    pub async fn subtask_summary(&self) -> Result<SubtaskSummary, TaskError> {
        Ok(self
            .runtime
            .store
            .subtask_summary(&self.record.id, &self.record.stage)
            .await?)
    }

    // ========================================================================
    // Ports
    // ========================================================================

    /// Resource port.
    pub fn resources(&self) -> &Arc<dyn ResourcePort> {
        &self.runtime.resources
    }

    /// Quota port.
    pub fn quota(&self) -> &Arc<dyn QuotaPort> {
        &self.runtime.quota
    }

    /// Notification port.
    pub fn notifier(&self) -> &Arc<dyn NotificationPort> {
        &self.runtime.notifier
    }

    /// Lock port.
    ///
    /// Locks on the bound objects and on the task itself are already held
    /// by this dispatch and are granted immediately.
    pub fn locks(&self) -> &Arc<dyn LockPort> {
        &self.locks
    }

    /// Set the status of every bound object. Errors are logged.
    pub async fn set_status(&self, status: &str, reason: Option<&str>) {
        for object in &self.objects {
            if let Err(e) = self
                .runtime
                .resources
                .set_status(&object.kind, &object.id, status, reason)
                .await
            {
                warn!(task_id = %self.record.id, object_id = %object.id, status, error = %e, "Failed to set status");
            }
        }
    }

    /// Append an ops-log entry for every bound object. Errors are logged.
    pub async fn ops_log(&self, action: &str, note: &str) {
        for object in &self.objects {
            let entry = OpsLogEntry {
                kind: object.kind.clone(),
                id: object.id.clone(),
                action: action.to_string(),
                note: note.to_string(),
                user_id: self.record.user_cred.user_id.clone(),
                at: Utc::now(),
            };
            if let Err(e) = self.runtime.resources.add_ops_log(entry).await {
                warn!(task_id = %self.record.id, error = %e, "Failed to write ops log");
            }
        }
    }

    /// Append an action-log entry for every bound object. Errors are logged.
    pub async fn action_log(&self, action: &str, success: bool, note: &str) {
        for object in &self.objects {
            let entry = ActionLogEntry {
                kind: object.kind.clone(),
                id: object.id.clone(),
                action: action.to_string(),
                success,
                note: note.to_string(),
                user_id: self.record.user_cred.user_id.clone(),
                at: Utc::now(),
            };
            if let Err(e) = self.runtime.resources.add_action_log(entry).await {
                warn!(task_id = %self.record.id, error = %e, "Failed to write action log");
            }
        }
    }

    /// Emit `action` for every bound object. Errors are logged.
    pub async fn notify(&self, action: &str) {
        for object in &self.objects {
            let event = NotifyEvent {
                action: action.to_string(),
                kind: object.kind.clone(),
                id: object.id.clone(),
                name: object.name.clone(),
                user_id: self.record.user_cred.user_id.clone(),
            };
            if let Err(e) = self.runtime.notifier.notify(event).await {
                warn!(task_id = %self.record.id, action, error = %e, "Failed to send notification");
            }
        }
    }
}
