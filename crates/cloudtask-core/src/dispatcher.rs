// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage dispatcher.
//!
//! One dispatch resolves the handler for a task's current stage and runs it:
//!
//! 1. Take the per-task lock; at most one handler runs per task.
//! 2. Load the record. Terminal tasks ignore the payload; a callback naming a
//!    stage the task already left is dropped as stale.
//! 3. A pending cancel request terminates the task as `Cancelled`.
//! 4. Resolve `stage` (success) or `stage + "Failed"` (failure). Without a
//!    handler the default rule completes on success and fails on failure,
//!    propagating the reason unchanged.
//! 5. Load and lock the bound objects in id order; a missing object fails
//!    the task.
//! 6. Run the handler on its own tokio task. An `Err` fails the task; a panic
//!    fails it, marks the objects `UNKNOWN` and writes a `panic` action-log.
//! 7. Release the locks, then schedule everything the handler deferred
//!    (child `init` dispatches, `schedule_run` payloads) and start its local
//!    jobs.
//!
//! Local jobs (see [`crate::TaskContext::run_local`]) run outside the
//! dispatch permits and hold no lock; their outcome comes back as an
//! ordinary dispatch of the stage they were started for.
//!
//! Termination (see [`RuntimeInner::finish`]) releases pending usage and
//! signals the parent only when the store reports that this call performed
//! the terminal write.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::TaskContext;
use crate::error::{CoreError, ErrorKind, TaskError};
use crate::persistence::{SubtaskStatus, SubtaskSummary};
use crate::ports::{ActionLogEntry, LockGuard, LockPort, Resource, status};
use crate::record::{
    Outcome, Payload, REASON_KEY, STATUS_ERROR, STATUS_KEY, TASK_NAME_KEY, TaskRecord,
    failure_result,
};
use crate::runtime::RuntimeInner;

/// Lock class serializing handler invocations of one task.
pub(crate) const TASK_LOCK_CLASS: &str = "tasks";
/// Lock class serializing subtask bookkeeping of one parent.
pub(crate) const SUBTASK_LOCK_CLASS: &str = "subtasks";

/// Delivery attempts for one remote parent notification.
pub(crate) const MAX_REMOTE_NOTIFY_TRIES: u32 = 5;
/// Pause before the n-th retry is n times this.
const REMOTE_NOTIFY_BACKOFF: Duration = Duration::from_millis(500);

/// What a single dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A stage handler ran.
    Handled,
    /// No handler matched; the default rule terminated the task.
    Defaulted,
    /// The task was already terminal.
    IgnoredTerminal,
    /// The callback named a stage the task already left.
    Stale,
    /// The task had a pending cancel request and was terminated.
    Cancelled,
    /// Dispatch failed before a handler ran and the task was failed.
    Rejected,
}

/// Job started by [`crate::TaskContext::run_local`].
pub(crate) type LocalJob = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>;

/// Work requested by a handler, started once the handler returns.
pub(crate) enum Deferred {
    /// Deliver `payload` to a task.
    Dispatch {
        task_id: String,
        payload: Payload,
        expected_stage: Option<String>,
    },
    /// Run `job`, then deliver its outcome to `stage`.
    Local {
        task_id: String,
        stage: String,
        job: LocalJob,
    },
}

/// Lock port seen by a handler.
///
/// Object locks its dispatch already holds are granted at once; every other
/// request goes to the shared port. Only meaningful while the handler runs.
pub(crate) struct HeldLocks {
    inner: Arc<dyn LockPort>,
    held: HashSet<(String, String)>,
}

impl HeldLocks {
    fn for_dispatch(inner: Arc<dyn LockPort>, record: &TaskRecord) -> Self {
        let mut held = HashSet::new();
        held.insert((TASK_LOCK_CLASS.to_string(), record.id.clone()));
        if let Some(object) = &record.object {
            for id in &object.ids {
                held.insert((object.kind.clone(), id.clone()));
            }
        }
        Self { inner, held }
    }
}

#[async_trait]
impl LockPort for HeldLocks {
    async fn lock_class(&self, class: &str) -> LockGuard {
        self.inner.lock_class(class).await
    }

    async fn lock_object(&self, class: &str, id: &str) -> LockGuard {
        if self.held.contains(&(class.to_string(), id.to_string())) {
            return LockGuard::new(());
        }
        self.inner.lock_object(class, id).await
    }
}

impl RuntimeInner {
    /// Queue a dispatch on the worker pool.
    pub(crate) fn schedule(
        self: &Arc<Self>,
        task_id: String,
        payload: Payload,
        expected_stage: Option<String>,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            warn!(task_id = %task_id, "Runtime is shut down, dropping dispatch");
            return;
        }

        self.in_flight.send_modify(|n| *n += 1);
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner
                .dispatch(&task_id, payload, expected_stage.as_deref())
                .await
            {
                error!(task_id = %task_id, error = %e, "Dispatch failed");
            }
            inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Run one dispatch to completion.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        task_id: &str,
        payload: Payload,
        expected_stage: Option<&str>,
    ) -> Result<DispatchOutcome, CoreError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::ShutDown)?;
        let _task_lock = self.locks.lock_object(TASK_LOCK_CLASS, task_id).await;

        let record = self.store.load(task_id).await?;
        if record.is_terminal() {
            debug!(task_id = %task_id, stage = %record.stage, "Task is terminal, ignoring payload");
            return Ok(DispatchOutcome::IgnoredTerminal);
        }
        if let Some(expected) = expected_stage
            && expected != record.stage
        {
            debug!(
                task_id = %task_id,
                expected = %expected,
                actual = %record.stage,
                "Dropping stale callback"
            );
            return Ok(DispatchOutcome::Stale);
        }
        if record.cancel_requested {
            let err = TaskError::cancelled("task cancelled");
            self.finish_failed(&record, record.handler_stage(), err)
                .await?;
            return Ok(DispatchOutcome::Cancelled);
        }
        if record.started_at.is_none() {
            self.store.mark_started(task_id).await?;
        }

        let stage = record.handler_stage().to_string();
        let Some(kind) = self.registry.lookup(&record.kind) else {
            let err = TaskError::internal(format!("task kind {} is not registered", record.kind));
            self.finish_failed(&record, &stage, err).await?;
            return Ok(DispatchOutcome::Rejected);
        };

        let Some(handler) = kind.handler(&stage, payload.polarity()).cloned() else {
            self.apply_default(&record, &stage, payload).await?;
            return Ok(DispatchOutcome::Defaulted);
        };

        let objects = match self.bind_objects(&record).await {
            Ok(objects) => objects,
            Err(err) => {
                self.finish_failed(&record, &stage, err).await?;
                return Ok(DispatchOutcome::Rejected);
            }
        };
        let object_locks = self.lock_objects(&record).await;
        let held: Arc<dyn LockPort> = Arc::new(HeldLocks::for_dispatch(self.locks.clone(), &record));

        let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel();
        let ctx = TaskContext::new(self.clone(), record.clone(), objects, held, deferred_tx);

        debug!(
            task_id = %task_id,
            kind = %record.kind,
            stage = %stage,
            polarity = ?payload.polarity(),
            "Invoking stage handler"
        );

        let handler_ok = match tokio::spawn(handler(ctx, payload)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                let current = self.store.load(task_id).await?;
                if !current.is_terminal() {
                    self.finish_failed(&current, current.handler_stage(), err)
                        .await?;
                }
                false
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "handler task was aborted".to_string()
                };
                self.handle_panic(&record, &stage, &message).await?;
                false
            }
        };

        drop(object_locks);
        while let Ok(deferred) = deferred_rx.try_recv() {
            match deferred {
                Deferred::Dispatch {
                    task_id,
                    payload,
                    expected_stage,
                } => self.schedule(task_id, payload, expected_stage),
                Deferred::Local {
                    task_id,
                    stage,
                    job,
                } if handler_ok => self.spawn_local(task_id, stage, job),
                Deferred::Local { task_id, stage, .. } => {
                    debug!(task_id = %task_id, stage = %stage, "Handler failed, local job dropped");
                }
            }
        }

        Ok(DispatchOutcome::Handled)
    }

    /// Start a local job and route its outcome back to `stage`.
    ///
    /// The job waits for a local-run permit, never a dispatch permit. A
    /// cancel request aborts it through the handle kept in `local_runs`.
    pub(crate) fn spawn_local(self: &Arc<Self>, task_id: String, stage: String, job: LocalJob) {
        if self.closed.load(Ordering::SeqCst) {
            warn!(task_id = %task_id, "Runtime is shut down, dropping local job");
            return;
        }

        self.in_flight.send_modify(|n| *n += 1);
        let permits = self.local_permits.clone();
        let store = self.store.clone();
        let id = task_id.clone();
        let run = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| TaskError::internal("runtime is shut down"))?;
            // A cancel that landed before the abort handle was registered.
            let record = store.load(&id).await?;
            if record.is_terminal() || record.cancel_requested {
                return Err(TaskError::cancelled(format!(
                    "task {} cancelled before its local job started",
                    id
                )));
            }
            job.await
        });
        let run_id = run.id();
        self.local_runs.insert(task_id.clone(), run.abort_handle());
        debug!(task_id = %task_id, stage = %stage, "Local job started");

        let inner = self.clone();
        tokio::spawn(async move {
            let payload = match run.await {
                Ok(Ok(data)) => Payload::Success(data),
                Ok(Err(err)) => Payload::Failure(err),
                Err(join_err) if join_err.is_cancelled() => {
                    Payload::Failure(TaskError::cancelled("local job aborted"))
                }
                Err(join_err) => Payload::Failure(TaskError::internal(format!(
                    "local job panicked: {}",
                    panic_message(join_err.into_panic())
                ))),
            };
            inner
                .local_runs
                .remove_if(&task_id, |_, handle| handle.id() == run_id);
            debug!(
                task_id = %task_id,
                stage = %stage,
                polarity = ?payload.polarity(),
                "Local job finished"
            );
            inner.schedule(task_id, payload, Some(stage));
            inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Abort the running local job of `task_id`, if any.
    pub(crate) fn abort_local(&self, task_id: &str) {
        if let Some((_, handle)) = self.local_runs.remove(task_id) {
            debug!(task_id = %task_id, "Aborting local job");
            handle.abort();
        }
    }

    /// Terminate a task and run the exactly-once side effects.
    ///
    /// Returns `false` when the task was already terminal.
    pub(crate) async fn finish(
        self: &Arc<Self>,
        record: &TaskRecord,
        outcome: Outcome,
        result: Value,
    ) -> Result<bool, CoreError> {
        let applied = self.store.terminate(&record.id, outcome, &result).await?;
        if !applied {
            debug!(task_id = %record.id, "Task already terminated");
            return Ok(false);
        }

        info!(
            task_id = %record.id,
            kind = %record.kind,
            outcome = outcome.stage(),
            "Task terminated"
        );

        if let Some(usage) = &record.pending_usage
            && !usage.is_null()
            && let Err(e) = self.quota.release(&record.user_cred, usage).await
        {
            warn!(task_id = %record.id, error = %e, "Failed to release pending usage");
        }

        self.terminal_tx.send_modify(|n| *n = n.wrapping_add(1));

        match (&record.parent_notify_url, &record.parent_id) {
            (Some(url), _) => self.notify_remote_parent(record, url, outcome, &result),
            (None, Some(parent_id)) => {
                self.signal_parent(record, parent_id, outcome, &result)
                    .await?;
            }
            (None, None) => {}
        }
        Ok(true)
    }

    /// POST the terminal body to a parent in another service.
    ///
    /// Runs in the background; failed attempts are retried up to
    /// [`MAX_REMOTE_NOTIFY_TRIES`] times and never affect the task.
    fn notify_remote_parent(
        self: &Arc<Self>,
        record: &TaskRecord,
        url: &str,
        outcome: Outcome,
        result: &Value,
    ) {
        let Some(port) = self.parent_notifier.clone() else {
            warn!(task_id = %record.id, url = %url, "No parent notifier configured, remote parent not signalled");
            return;
        };

        let body = remote_parent_body(record, outcome, result);
        let url = url.to_string();
        let task_id = record.id.clone();
        let parent_id = record.parent_id.clone();
        self.in_flight.send_modify(|n| *n += 1);
        let inner = self.clone();
        tokio::spawn(async move {
            for attempt in 1..=MAX_REMOTE_NOTIFY_TRIES {
                match port.deliver(&url, parent_id.as_deref(), &body).await {
                    Ok(()) => {
                        debug!(task_id = %task_id, url = %url, attempt, "Remote parent notified");
                        break;
                    }
                    Err(e) if attempt < MAX_REMOTE_NOTIFY_TRIES => {
                        warn!(task_id = %task_id, url = %url, attempt, error = %e, "Remote parent notification failed, retrying");
                        tokio::time::sleep(REMOTE_NOTIFY_BACKOFF * attempt).await;
                    }
                    Err(e) => {
                        error!(task_id = %task_id, url = %url, error = %e, "Giving up on remote parent notification");
                    }
                }
            }
            inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Terminate a task as failed with `err` recorded against `stage`.
    pub(crate) async fn finish_failed(
        self: &Arc<Self>,
        record: &TaskRecord,
        stage: &str,
        err: TaskError,
    ) -> Result<bool, CoreError> {
        warn!(
            task_id = %record.id,
            kind = %record.kind,
            stage = %stage,
            error = %err,
            "Task failing"
        );
        self.finish(record, Outcome::Failed, failure_result(stage, &err))
            .await
    }

    async fn signal_parent(
        self: &Arc<Self>,
        child: &TaskRecord,
        parent_id: &str,
        outcome: Outcome,
        result: &Value,
    ) -> Result<(), CoreError> {
        let summary = {
            let _guard = self.locks.lock_object(SUBTASK_LOCK_CLASS, parent_id).await;
            self.store
                .record_subtask_result(parent_id, &child.id, outcome == Outcome::Complete, result)
                .await?
        };

        let Some(summary) = summary else {
            debug!(task_id = %child.id, parent_id = %parent_id, "Child already recorded");
            return Ok(());
        };
        if let Err(e) = self.store.set_progress(parent_id, summary.progress()).await {
            warn!(parent_id = %parent_id, error = %e, "Failed to record parent progress");
        }
        if summary.pending() > 0 {
            debug!(
                parent_id = %parent_id,
                stage = %summary.stage,
                pending = summary.pending(),
                "Waiting for sibling subtasks"
            );
            return Ok(());
        }

        let stage = summary.stage.clone();
        self.schedule(parent_id.to_string(), aggregate_payload(&summary), Some(stage));
        Ok(())
    }

    async fn apply_default(
        self: &Arc<Self>,
        record: &TaskRecord,
        stage: &str,
        payload: Payload,
    ) -> Result<(), CoreError> {
        match payload {
            Payload::Success(data) => {
                debug!(task_id = %record.id, stage = %stage, "No handler, completing");
                let empty = data.is_null() || data.as_object().is_some_and(|m| m.is_empty());
                let result = if empty { default_result(record) } else { data };
                self.finish(record, Outcome::Complete, result).await?;
            }
            Payload::Failure(err) => {
                self.finish_failed(record, stage, err).await?;
            }
        }
        Ok(())
    }

    async fn bind_objects(&self, record: &TaskRecord) -> Result<Vec<Resource>, TaskError> {
        let Some(object) = &record.object else {
            return Ok(Vec::new());
        };

        let mut objects = Vec::with_capacity(object.ids.len());
        for id in &object.ids {
            match self.resources.fetch(&object.kind, id).await? {
                Some(resource) => objects.push(resource),
                None => {
                    return Err(TaskError::not_found(format!(
                        "fail to find {} object {}",
                        object.kind, id
                    )));
                }
            }
        }
        Ok(objects)
    }

    async fn lock_objects(&self, record: &TaskRecord) -> Vec<LockGuard> {
        let Some(object) = &record.object else {
            return Vec::new();
        };

        // Sorted order avoids deadlock between overlapping batch tasks.
        let mut ids: Vec<&String> = object.ids.iter().collect();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.locks.lock_object(&object.kind, id).await);
        }
        guards
    }

    async fn handle_panic(
        self: &Arc<Self>,
        record: &TaskRecord,
        stage: &str,
        message: &str,
    ) -> Result<(), CoreError> {
        error!(
            task_id = %record.id,
            kind = %record.kind,
            stage = %stage,
            panic = %message,
            "Stage handler panicked"
        );

        if let Some(object) = &record.object {
            for id in &object.ids {
                if let Err(e) = self
                    .resources
                    .set_status(&object.kind, id, status::UNKNOWN, Some(message))
                    .await
                {
                    warn!(task_id = %record.id, object_id = %id, error = %e, "Failed to reset status after panic");
                }
                let entry = ActionLogEntry {
                    kind: object.kind.clone(),
                    id: id.clone(),
                    action: "panic".to_string(),
                    success: false,
                    note: message.to_string(),
                    user_id: record.user_cred.user_id.clone(),
                    at: Utc::now(),
                };
                if let Err(e) = self.resources.add_action_log(entry).await {
                    warn!(task_id = %record.id, error = %e, "Failed to write panic action log");
                }
            }
        }

        let err = TaskError::internal(format!("handler panicked: {}", message));
        self.finish_failed(record, stage, err).await?;
        Ok(())
    }
}

/// Result recorded when a task completes without data.
pub(crate) fn default_result(record: &TaskRecord) -> Value {
    match &record.object {
        Some(object) => json!({
            "id": object.primary_id(),
            "name": object.name,
            "kind": object.kind,
        }),
        None => json!({"id": record.id}),
    }
}

/// Payload delivered to a parent once every child of a stage terminated.
///
/// A single child passes its own result (or reason) through. Several
/// children produce a summary; any failure turns it into a failure whose
/// message joins the child reasons and whose details hold the summary.
pub(crate) fn aggregate_payload(summary: &SubtaskSummary) -> Payload {
    if let [only] = summary.children.as_slice() {
        let result = only.result.clone().unwrap_or(Value::Null);
        return match only.status {
            SubtaskStatus::Failed => Payload::Failure(child_failure(&result)),
            _ => Payload::Success(result),
        };
    }

    if !summary.any_failed() {
        return Payload::Success(summary.to_json());
    }

    let errors: Vec<TaskError> = summary
        .failures()
        .map(|c| child_failure(c.result.as_ref().unwrap_or(&Value::Null)))
        .collect();
    let kind = match errors.first() {
        Some(first) if errors.iter().all(|e| e.kind == first.kind) => first.kind,
        _ => ErrorKind::Remote,
    };
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    Payload::Failure(
        TaskError::new(
            kind,
            format!("{} of {} subtasks failed: {}", errors.len(), summary.total(), message),
        )
        .with_details(summary.to_json()),
    )
}

/// Body POSTed to a remote parent: the result on success, a failure
/// envelope naming the kind and reason otherwise.
pub(crate) fn remote_parent_body(record: &TaskRecord, outcome: Outcome, result: &Value) -> Value {
    match outcome {
        Outcome::Complete => result.clone(),
        Outcome::Failed => json!({
            STATUS_KEY: STATUS_ERROR,
            TASK_NAME_KEY: record.kind,
            REASON_KEY: result.get(REASON_KEY).cloned().unwrap_or(Value::Null),
        }),
    }
}

fn child_failure(result: &Value) -> TaskError {
    match result.get(REASON_KEY) {
        Some(reason) => TaskError::from_reason(reason),
        None => TaskError::from_reason(result),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
