// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process port implementations.
//!
//! Used by the sandbox server and by tests, which inspect the recorded
//! logs, events and quota counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    ActionLogEntry, LockGuard, LockPort, NotificationPort, NotifyEvent, OpsLogEntry,
    ParentNotifyPort, QuotaPort, Resource, ResourcePatch, ResourcePort,
};
use crate::error::TaskError;
use crate::record::UserCred;

type ResourceKey = (String, String);

fn key(kind: &str, id: &str) -> ResourceKey {
    (kind.to_string(), id.to_string())
}

fn missing(kind: &str, id: &str) -> TaskError {
    TaskError::not_found(format!("fail to find {} object {}", kind, id))
}

/// Resource table held in memory.
#[derive(Default)]
pub struct InMemoryResources {
    resources: DashMap<ResourceKey, Resource>,
    update_failures: DashMap<ResourceKey, TaskError>,
    status_history: Mutex<Vec<(String, String, String)>>,
    ops_log: Mutex<Vec<OpsLogEntry>>,
    action_log: Mutex<Vec<ActionLogEntry>>,
}

impl InMemoryResources {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a resource directly.
    pub fn insert(&self, resource: Resource) {
        self.resources
            .insert(key(&resource.kind, &resource.id), resource);
    }

    /// Snapshot of one resource.
    pub fn get(&self, kind: &str, id: &str) -> Option<Resource> {
        self.resources.get(&key(kind, id)).map(|r| r.clone())
    }

    /// Make every later [`ResourcePort::update`] of `(kind, id)` fail with `err`.
    pub fn fail_update(&self, kind: &str, id: &str, err: TaskError) {
        self.update_failures.insert(key(kind, id), err);
    }

    /// Every status written for `(kind, id)`, in order.
    pub async fn statuses(&self, kind: &str, id: &str) -> Vec<String> {
        self.status_history
            .lock()
            .await
            .iter()
            .filter(|(k, i, _)| k == kind && i == id)
            .map(|(_, _, s)| s.clone())
            .collect()
    }

    /// Recorded ops-log.
    pub async fn ops_log(&self) -> Vec<OpsLogEntry> {
        self.ops_log.lock().await.clone()
    }

    /// Recorded action-log.
    pub async fn action_log(&self) -> Vec<ActionLogEntry> {
        self.action_log.lock().await.clone()
    }
}

#[async_trait]
impl ResourcePort for InMemoryResources {
    async fn fetch(&self, kind: &str, id: &str) -> Result<Option<Resource>, TaskError> {
        Ok(self.get(kind, id))
    }

    async fn list_by_attribute(
        &self,
        kind: &str,
        attr: &str,
        value: &str,
    ) -> Result<Vec<Resource>, TaskError> {
        let mut found: Vec<Resource> = self
            .resources
            .iter()
            .filter(|r| r.kind == kind && r.attr_str(attr) == Some(value))
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn create(&self, resource: Resource) -> Result<Resource, TaskError> {
        let k = key(&resource.kind, &resource.id);
        if self.resources.contains_key(&k) {
            return Err(TaskError::validation(format!(
                "{} {} already exists",
                resource.kind, resource.id
            )));
        }
        self.resources.insert(k, resource.clone());
        Ok(resource)
    }

    async fn update(
        &self,
        kind: &str,
        id: &str,
        patch: ResourcePatch,
    ) -> Result<Resource, TaskError> {
        if let Some(err) = self.update_failures.get(&key(kind, id)) {
            return Err(err.clone());
        }
        let mut entry = self
            .resources
            .get_mut(&key(kind, id))
            .ok_or_else(|| missing(kind, id))?;
        if let Some(external_id) = patch.external_id {
            entry.external_id = Some(external_id);
        }
        if let Some(pending_deleted) = patch.pending_deleted {
            entry.pending_deleted = pending_deleted;
        }
        for (k, v) in patch.attributes {
            entry.attributes.insert(k, v);
        }
        Ok(entry.clone())
    }

    async fn set_status(
        &self,
        kind: &str,
        id: &str,
        status: &str,
        reason: Option<&str>,
    ) -> Result<(), TaskError> {
        {
            let mut entry = self
                .resources
                .get_mut(&key(kind, id))
                .ok_or_else(|| missing(kind, id))?;
            entry.status = status.to_string();
            entry.status_reason = reason.map(str::to_string);
        }
        self.status_history
            .lock()
            .await
            .push((kind.to_string(), id.to_string(), status.to_string()));
        Ok(())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<(), TaskError> {
        self.resources.remove(&key(kind, id));
        Ok(())
    }

    async fn set_metadata(
        &self,
        kind: &str,
        id: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), TaskError> {
        let mut entry = self
            .resources
            .get_mut(&key(kind, id))
            .ok_or_else(|| missing(kind, id))?;
        for (k, v) in metadata {
            entry.metadata.insert(k, v);
        }
        Ok(())
    }

    async fn add_ops_log(&self, entry: OpsLogEntry) -> Result<(), TaskError> {
        self.ops_log.lock().await.push(entry);
        Ok(())
    }

    async fn add_action_log(&self, entry: ActionLogEntry) -> Result<(), TaskError> {
        self.action_log.lock().await.push(entry);
        Ok(())
    }
}

/// Quota port that counts reservations and releases.
#[derive(Default)]
pub struct RecordingQuota {
    reserved: AtomicUsize,
    released: AtomicUsize,
    cancelled: AtomicUsize,
    releases: Mutex<Vec<(String, Value)>>,
    cancels: Mutex<Vec<Value>>,
}

impl RecordingQuota {
    /// Create a quota with zero counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the caller reserving `usage` before submitting a task.
    pub fn reserve(&self, _user_cred: &UserCred, usage: &Value) -> Value {
        self.reserved.fetch_add(1, Ordering::SeqCst);
        usage.clone()
    }

    /// Reservations made.
    pub fn reserve_count(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Reservations released by the runtime.
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Sub-reservations cancelled by handlers.
    pub fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Released usages with the releasing project.
    pub async fn releases(&self) -> Vec<(String, Value)> {
        self.releases.lock().await.clone()
    }

    /// Cancelled usages, in order.
    pub async fn cancels(&self) -> Vec<Value> {
        self.cancels.lock().await.clone()
    }
}

#[async_trait]
impl QuotaPort for RecordingQuota {
    async fn release(&self, user_cred: &UserCred, usage: &Value) -> Result<(), TaskError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.releases
            .lock()
            .await
            .push((user_cred.project_id.clone(), usage.clone()));
        Ok(())
    }

    async fn cancel(&self, _user_cred: &UserCred, usage: &Value) -> Result<(), TaskError> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        self.cancels.lock().await.push(usage.clone());
        Ok(())
    }
}

/// Notification port that keeps every event.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    pub async fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().await.clone()
    }

    /// Number of events with the given action.
    pub async fn count(&self, action: &str) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait]
impl NotificationPort for RecordingNotifier {
    async fn notify(&self, event: NotifyEvent) -> Result<(), TaskError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// One delivery attempt seen by [`RecordingParentNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParentDelivery {
    /// Target URL.
    pub url: String,
    /// `X-Task-Id` sent with the request.
    pub parent_id: Option<String>,
    /// Posted body.
    pub body: Value,
}

/// Parent notifier that records every attempt and fails the first few.
#[derive(Default)]
pub struct RecordingParentNotifier {
    fail_first: AtomicUsize,
    attempts: Mutex<Vec<ParentDelivery>>,
}

impl RecordingParentNotifier {
    /// Notifier accepting every delivery.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier refusing the first `n` attempts.
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(n),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Every attempt, accepted or not.
    pub async fn attempts(&self) -> Vec<ParentDelivery> {
        self.attempts.lock().await.clone()
    }
}

#[async_trait]
impl ParentNotifyPort for RecordingParentNotifier {
    async fn deliver(
        &self,
        url: &str,
        parent_id: Option<&str>,
        body: &Value,
    ) -> Result<(), TaskError> {
        self.attempts.lock().await.push(ParentDelivery {
            url: url.to_string(),
            parent_id: parent_id.map(str::to_string),
            body: body.clone(),
        });
        let refused = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TaskError::remote(format!("{} unreachable", url)));
        }
        Ok(())
    }
}

/// Process-local named locks.
///
/// Entries are dropped from the table once no holder or waiter remains.
#[derive(Default, Clone)]
pub struct LocalLocks {
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

struct LocalGuard {
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl LocalLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.table.len()
    }

    async fn acquire(&self, key: String) -> LockGuard {
        let lock = self.table.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        LockGuard::new(LocalGuard {
            table: self.table.clone(),
            key,
            guard: Some(guard),
        })
    }
}

#[async_trait]
impl LockPort for LocalLocks {
    async fn lock_class(&self, class: &str) -> LockGuard {
        self.acquire(class.to_string()).await
    }

    async fn lock_object(&self, class: &str, id: &str) -> LockGuard {
        self.acquire(format!("{}/{}", class, id)).await
    }
}
