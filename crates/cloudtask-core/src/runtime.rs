// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task runtime: submission, callbacks, cancellation and recovery.
//!
//! Build one with [`TaskRuntimeBuilder`]:
//!
//! ```ignore
//! let runtime = TaskRuntimeBuilder::new()
//!     .with_store(store)
//!     .with_registry(registry)
//!     .with_resources(resources)
//!     .with_quota(quota)
//!     .with_notifier(notifier)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let task_id = runtime.submit(TaskSubmission::new("GuestStopTask")
//!     .object(ObjectRef::single("guest", "g-1"))).await?;
//! ```
//!
//! Every dispatch runs on the tokio runtime, bounded by a semaphore of
//! `max_concurrent_dispatches` permits. Local jobs started with
//! [`crate::TaskContext::run_local`] have their own bound,
//! `max_concurrent_local_runs`, so long waits never starve dispatches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::cleanup_worker::{TaskCleanupWorker, TaskCleanupWorkerConfig};
use crate::config::Config;
use crate::dispatcher::DispatchOutcome;
use crate::error::{CoreError, TaskError};
use crate::persistence::{SubtaskSummary, TaskFilter, TaskStore};
use crate::ports::memory::LocalLocks;
use crate::ports::{LockPort, NotificationPort, ParentNotifyPort, QuotaPort, ResourcePort};
use crate::record::{INIT_STAGE, ObjectRef, Payload, TaskRecord, UserCred};
use crate::registry::TaskKindRegistry;

/// Default bound on concurrently running dispatches.
pub const DEFAULT_MAX_CONCURRENT_DISPATCHES: usize = 32;
/// Default bound on concurrently running local jobs.
pub const DEFAULT_MAX_CONCURRENT_LOCAL_RUNS: usize = 256;

/// Link from a child to the parent stage it reports to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    /// Parent task id.
    pub task_id: String,
    /// Parent stage invoked once every child of that stage terminated.
    pub stage: String,
}

/// Request to create a task.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    /// Registered kind name.
    pub kind: String,
    /// Target resource(s).
    pub object: Option<ObjectRef>,
    /// Creation parameters.
    pub params: Map<String, Value>,
    /// Caller identity; children inherit the parent's when unset.
    pub user_cred: Option<UserCred>,
    /// Parent to signal on termination.
    pub parent: Option<ParentLink>,
    /// Remote parent endpoint POSTed with the terminal body.
    pub parent_notify_url: Option<String>,
    /// Id of the remote parent, sent along with the terminal body.
    pub remote_parent_id: Option<String>,
    /// Quota reservation released when the task terminates.
    pub pending_usage: Option<Value>,
}

impl TaskSubmission {
    /// Submission of `kind` with no object and no parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            object: None,
            params: Map::new(),
            user_cred: None,
            parent: None,
            parent_notify_url: None,
            remote_parent_id: None,
            pending_usage: None,
        }
    }

    /// Target object(s).
    pub fn object(mut self, object: ObjectRef) -> Self {
        self.object = Some(object);
        self
    }

    /// Add one parameter.
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Replace all parameters.
    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Caller identity.
    pub fn user_cred(mut self, user_cred: UserCred) -> Self {
        self.user_cred = Some(user_cred);
        self
    }

    /// Report to `stage` of `task_id` on termination.
    pub fn parent(mut self, task_id: impl Into<String>, stage: impl Into<String>) -> Self {
        self.parent = Some(ParentLink {
            task_id: task_id.into(),
            stage: stage.into(),
        });
        self
    }

    /// Report the terminal body to a parent task in another service.
    pub fn parent_notify_url(mut self, url: impl Into<String>) -> Self {
        self.parent_notify_url = Some(url.into());
        self
    }

    /// Id of the remote parent behind [`TaskSubmission::parent_notify_url`].
    pub fn remote_parent_id(mut self, task_id: impl Into<String>) -> Self {
        self.remote_parent_id = Some(task_id.into());
        self
    }

    /// Quota reservation owned by the task.
    pub fn pending_usage(mut self, usage: Value) -> Self {
        self.pending_usage = Some(usage);
        self
    }
}

/// Shared state behind [`TaskRuntime`] and every [`crate::TaskContext`].
pub(crate) struct RuntimeInner {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<TaskKindRegistry>,
    pub(crate) resources: Arc<dyn ResourcePort>,
    pub(crate) quota: Arc<dyn QuotaPort>,
    pub(crate) notifier: Arc<dyn NotificationPort>,
    pub(crate) locks: Arc<dyn LockPort>,
    pub(crate) parent_notifier: Option<Arc<dyn ParentNotifyPort>>,
    pub(crate) service_url: Option<String>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) local_permits: Arc<Semaphore>,
    pub(crate) local_runs: DashMap<String, AbortHandle>,
    pub(crate) terminal_tx: watch::Sender<u64>,
    pub(crate) in_flight: watch::Sender<usize>,
    pub(crate) closed: AtomicBool,
    background: Mutex<Option<(Arc<Notify>, JoinHandle<()>)>>,
}

impl RuntimeInner {
    /// Validate a submission and build its record.
    pub(crate) fn prepare(
        &self,
        submission: TaskSubmission,
        inherited_cred: Option<&UserCred>,
    ) -> Result<TaskRecord, CoreError> {
        let kind = self
            .registry
            .lookup(&submission.kind)
            .ok_or_else(|| CoreError::KindNotFound {
                kind: submission.kind.clone(),
            })?;

        if let Some(object) = &submission.object {
            if object.ids.is_empty() {
                return Err(CoreError::validation("object", "object reference has no ids"));
            }
            if !kind.is_batch() && object.ids.len() > 1 {
                return Err(CoreError::validation(
                    "object",
                    format!("kind {} accepts a single object", kind.name()),
                ));
            }
        }
        if let Some(parent) = &submission.parent
            && parent.stage.is_empty()
        {
            return Err(CoreError::validation("parent", "parent stage must not be empty"));
        }
        if let Some(url) = &submission.parent_notify_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(CoreError::validation(
                "parent_notify_url",
                "must be an http(s) URL",
            ));
        }
        if submission.parent_notify_url.is_some() && submission.parent.is_some() {
            return Err(CoreError::validation(
                "parent_notify_url",
                "a task reports to a local or a remote parent, not both",
            ));
        }
        if submission.remote_parent_id.is_some() && submission.parent_notify_url.is_none() {
            return Err(CoreError::validation(
                "remote_parent_id",
                "a remote parent needs a notify URL",
            ));
        }

        let mut record = TaskRecord::new(submission.kind);
        record.params = submission.params;
        record.user_cred = submission
            .user_cred
            .or_else(|| inherited_cred.cloned())
            .unwrap_or_default();
        record.object = submission.object;
        record.pending_usage = submission.pending_usage;
        record.parent_notify_url = submission.parent_notify_url;
        record.parent_id = submission.remote_parent_id;
        if let Some(parent) = submission.parent {
            record.parent_id = Some(parent.task_id);
            record.parent_stage = Some(parent.stage);
        }
        Ok(record)
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::ShutDown);
        }
        Ok(())
    }
}

/// Configuration produced by [`TaskRuntimeBuilder::build`].
pub struct TaskRuntimeConfig {
    store: Arc<dyn TaskStore>,
    registry: TaskKindRegistry,
    resources: Arc<dyn ResourcePort>,
    quota: Arc<dyn QuotaPort>,
    notifier: Arc<dyn NotificationPort>,
    locks: Arc<dyn LockPort>,
    parent_notifier: Option<Arc<dyn ParentNotifyPort>>,
    max_concurrent_dispatches: usize,
    max_concurrent_local_runs: usize,
    service_url: Option<String>,
    cleanup: Option<TaskCleanupWorkerConfig>,
}

impl std::fmt::Debug for TaskRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntimeConfig")
            .field("store", &"...")
            .field("registry", &self.registry.names())
            .field("max_concurrent_dispatches", &self.max_concurrent_dispatches)
            .field("max_concurrent_local_runs", &self.max_concurrent_local_runs)
            .field("parent_notifier", &self.parent_notifier.is_some())
            .field("service_url", &self.service_url)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl TaskRuntimeConfig {
    /// Start the runtime and its background workers.
    pub async fn start(self) -> anyhow::Result<TaskRuntime> {
        let (terminal_tx, _) = watch::channel(0u64);
        let (in_flight, _) = watch::channel(0usize);

        let background = match self.cleanup {
            Some(config) if config.enabled => {
                let worker = TaskCleanupWorker::new(self.store.clone(), config);
                let shutdown = worker.shutdown_handle();
                let handle = tokio::spawn(async move { worker.run().await });
                Some((shutdown, handle))
            }
            _ => None,
        };

        info!(
            kinds = self.registry.len(),
            max_concurrent_dispatches = self.max_concurrent_dispatches,
            max_concurrent_local_runs = self.max_concurrent_local_runs,
            "Task runtime started"
        );

        Ok(TaskRuntime {
            inner: Arc::new(RuntimeInner {
                store: self.store,
                registry: Arc::new(self.registry),
                resources: self.resources,
                quota: self.quota,
                notifier: self.notifier,
                locks: self.locks,
                parent_notifier: self.parent_notifier,
                service_url: self.service_url,
                permits: Arc::new(Semaphore::new(self.max_concurrent_dispatches)),
                local_permits: Arc::new(Semaphore::new(self.max_concurrent_local_runs)),
                local_runs: DashMap::new(),
                terminal_tx,
                in_flight,
                closed: AtomicBool::new(false),
                background: Mutex::new(background),
            }),
        })
    }
}

/// Builder for [`TaskRuntime`].
pub struct TaskRuntimeBuilder {
    store: Option<Arc<dyn TaskStore>>,
    registry: Option<TaskKindRegistry>,
    resources: Option<Arc<dyn ResourcePort>>,
    quota: Option<Arc<dyn QuotaPort>>,
    notifier: Option<Arc<dyn NotificationPort>>,
    locks: Option<Arc<dyn LockPort>>,
    parent_notifier: Option<Arc<dyn ParentNotifyPort>>,
    max_concurrent_dispatches: usize,
    max_concurrent_local_runs: usize,
    service_url: Option<String>,
    cleanup: Option<TaskCleanupWorkerConfig>,
}

impl Default for TaskRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRuntimeBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            store: None,
            registry: None,
            resources: None,
            quota: None,
            notifier: None,
            locks: None,
            parent_notifier: None,
            max_concurrent_dispatches: DEFAULT_MAX_CONCURRENT_DISPATCHES,
            max_concurrent_local_runs: DEFAULT_MAX_CONCURRENT_LOCAL_RUNS,
            service_url: None,
            cleanup: None,
        }
    }

    /// Apply concurrency bounds, service URL and archive settings from `config`.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.max_concurrent_dispatches = config.max_concurrent_dispatches;
        self.max_concurrent_local_runs = config.max_concurrent_local_runs;
        self.service_url = config.service_url.clone();
        self.cleanup = Some(config.cleanup.clone());
        self
    }

    /// Task record store (required).
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Kind registry (required).
    pub fn with_registry(mut self, registry: TaskKindRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resource port (required).
    pub fn with_resources(mut self, resources: Arc<dyn ResourcePort>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Quota port (required).
    pub fn with_quota(mut self, quota: Arc<dyn QuotaPort>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Notification port (required).
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationPort>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Lock port; defaults to process-local locks.
    pub fn with_locks(mut self, locks: Arc<dyn LockPort>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Delivery of terminal bodies to remote parents. Without one, tasks
    /// carrying a parent notify URL only log that they could not report.
    pub fn with_parent_notifier(mut self, notifier: Arc<dyn ParentNotifyPort>) -> Self {
        self.parent_notifier = Some(notifier);
        self
    }

    /// Bound on concurrently running dispatches.
    pub fn with_max_concurrent_dispatches(mut self, max: usize) -> Self {
        self.max_concurrent_dispatches = max;
        self
    }

    /// Bound on concurrently running local jobs.
    pub fn with_max_concurrent_local_runs(mut self, max: usize) -> Self {
        self.max_concurrent_local_runs = max;
        self
    }

    /// Base URL advertised in `X-Task-Notify-Url`.
    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = Some(url.into());
        self
    }

    /// Enable the archive worker.
    pub fn with_cleanup(mut self, config: TaskCleanupWorkerConfig) -> Self {
        self.cleanup = Some(config);
        self
    }

    /// Validate and produce the runtime configuration.
    pub fn build(self) -> anyhow::Result<TaskRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("task store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("kind registry is required"))?;
        let resources = self
            .resources
            .ok_or_else(|| anyhow::anyhow!("resource port is required"))?;
        let quota = self
            .quota
            .ok_or_else(|| anyhow::anyhow!("quota port is required"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow::anyhow!("notification port is required"))?;
        if self.max_concurrent_dispatches == 0 {
            anyhow::bail!("max_concurrent_dispatches must be at least 1");
        }
        if self.max_concurrent_local_runs == 0 {
            anyhow::bail!("max_concurrent_local_runs must be at least 1");
        }

        Ok(TaskRuntimeConfig {
            store,
            registry,
            resources,
            quota,
            notifier,
            locks: self.locks.unwrap_or_else(|| Arc::new(LocalLocks::new())),
            parent_notifier: self.parent_notifier,
            max_concurrent_dispatches: self.max_concurrent_dispatches,
            max_concurrent_local_runs: self.max_concurrent_local_runs,
            service_url: self.service_url,
            cleanup: self.cleanup,
        })
    }
}

/// Handle to a running task engine. Cheap to clone.
#[derive(Clone)]
pub struct TaskRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("store", &"...")
            .field("kinds", &self.inner.registry.names())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TaskRuntime {
    /// Persist a new task and schedule its `OnInit` dispatch.
    #[instrument(skip(self, submission), fields(kind = %submission.kind))]
    pub async fn submit(&self, submission: TaskSubmission) -> Result<String, CoreError> {
        self.inner.ensure_open()?;

        let parent = submission.parent.clone();
        if let Some(parent) = &parent {
            self.inner.store.load(&parent.task_id).await?;
        }

        let record = self.inner.prepare(submission, None)?;
        self.inner.store.create(&record).await?;
        if let Some(parent) = parent {
            self.inner
                .store
                .register_subtasks(&parent.task_id, &parent.stage, std::slice::from_ref(&record.id))
                .await?;
        }

        info!(task_id = %record.id, "Task created");
        self.inner
            .schedule(record.id.clone(), Payload::empty(), Some(INIT_STAGE.to_string()));
        Ok(record.id)
    }

    /// Deliver an external callback body to a task.
    ///
    /// `expected_stage` guards against replays of callbacks meant for a
    /// stage the task already left.
    #[instrument(skip(self, body))]
    pub async fn callback(
        &self,
        task_id: &str,
        body: Value,
        expected_stage: Option<&str>,
    ) -> Result<(), CoreError> {
        self.inner.ensure_open()?;
        let record = self.inner.store.load(task_id).await?;
        if record.is_terminal() {
            debug!(task_id = %task_id, "Callback for terminal task ignored");
            return Ok(());
        }
        self.inner.schedule(
            task_id.to_string(),
            Payload::from_json(body),
            expected_stage.map(str::to_string),
        );
        Ok(())
    }

    /// Run one dispatch inline and report what it did.
    pub async fn dispatch(
        &self,
        task_id: &str,
        payload: Payload,
        expected_stage: Option<&str>,
    ) -> Result<DispatchOutcome, CoreError> {
        self.inner.ensure_open()?;
        self.inner.dispatch(task_id, payload, expected_stage).await
    }

    /// Request cancellation of a task and every incomplete descendant.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: &str) -> Result<(), CoreError> {
        self.inner.ensure_open()?;
        let record = self.inner.store.load(task_id).await?;
        if record.is_terminal() {
            return Err(CoreError::TaskTerminated {
                task_id: task_id.to_string(),
                stage: record.stage,
            });
        }
        self.cancel_tree(record.id).await
    }

    fn cancel_tree(
        &self,
        task_id: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let children = self
                .inner
                .store
                .list(&TaskFilter::incomplete_children(&task_id))
                .await?;
            for child in children {
                self.cancel_tree(child.id).await?;
            }

            if self.inner.store.request_cancel(&task_id).await? {
                info!(task_id = %task_id, "Cancel requested");
                self.inner.abort_local(&task_id);
                self.inner.schedule(
                    task_id,
                    Payload::Failure(TaskError::cancelled("task cancelled")),
                    None,
                );
            }
            Ok(())
        })
    }

    /// Fail every non-terminal task left over from a previous process.
    ///
    /// Each task receives a failure payload at its current stage, so its
    /// failure handler runs and cleans up. Returns the number scheduled.
    pub async fn recover_incomplete(&self) -> Result<usize, CoreError> {
        self.inner.ensure_open()?;
        let incomplete = self.inner.store.list_incomplete().await?;
        let count = incomplete.len();
        for record in incomplete {
            debug!(task_id = %record.id, stage = %record.stage, "Recovering task");
            self.inner.schedule(
                record.id,
                Payload::Failure(TaskError::internal("service restart")),
                None,
            );
        }
        if count > 0 {
            warn!(count, "Failing tasks interrupted by restart");
        }
        Ok(count)
    }

    /// Load one record.
    pub async fn get(&self, task_id: &str) -> Result<TaskRecord, CoreError> {
        self.inner.store.load(task_id).await
    }

    /// List records.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, CoreError> {
        self.inner.store.list(filter).await
    }

    /// Aggregation of children reporting to `stage` of `task_id`.
    pub async fn subtasks(&self, task_id: &str, stage: &str) -> Result<SubtaskSummary, CoreError> {
        self.inner.store.subtask_summary(task_id, stage).await
    }

    /// Wait until a task reaches a terminal stage.
    pub async fn wait_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskRecord, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.inner.terminal_tx.subscribe();
        loop {
            let record = self.inner.store.load(task_id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(CoreError::ShutDown),
                Err(_) => {
                    return Err(CoreError::WaitTimeout {
                        task_id: task_id.to_string(),
                    });
                }
            }
        }
    }

    /// Wait until no dispatch, local job or parent notification is queued
    /// or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        // The sender lives in `inner`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Number of dispatches, local jobs and parent notifications queued or
    /// running.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Registered kinds.
    pub fn registry(&self) -> &TaskKindRegistry {
        &self.inner.registry
    }

    /// Underlying task store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    /// Refuse new work, stop background workers, abort local jobs and drain
    /// running dispatches.
    ///
    /// Tasks whose local job was aborted stay at their stage and are failed
    /// by [`TaskRuntime::recover_incomplete`] on the next start.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Task runtime shutting down");
        self.inner.closed.store(true, Ordering::SeqCst);

        if let Some((shutdown, handle)) = self.inner.background.lock().await.take() {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!(error = %e, "Cleanup worker ended abnormally");
            }
        }

        for run in self.inner.local_runs.iter() {
            run.value().abort();
        }
        self.wait_idle().await;
        info!("Task runtime stopped");
        Ok(())
    }
}
