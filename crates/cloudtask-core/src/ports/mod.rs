// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability ports consumed by stage handlers.
//!
//! | Port | Purpose |
//! |------|---------|
//! | [`ResourcePort`] | Resource lookup, status, attributes, ops-log and action-log |
//! | [`QuotaPort`] | Release, split and cancel of pending usage |
//! | [`NotificationPort`] | Create/delete/update events for outside listeners |
//! | [`LockPort`] | Named class and object locks released on guard drop |
//! | [`ParentNotifyPort`] | Terminal results for parents living in another service |
//!
//! In-process implementations live in [`memory`]; the reqwest-backed
//! [`http::HttpParentNotifier`] comes with the `http` feature.

#[cfg(feature = "http")]
pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::record::UserCred;

/// Status strings shared by the runtime and most handlers.
pub mod status {
    /// Resource is ready for use.
    pub const AVAILABLE: &str = "AVAILABLE";
    /// Status is not known, e.g. after a handler panic.
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// A domain object a task acts upon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource kind, e.g. `guest`.
    pub kind: String,
    /// Local id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Machine-readable status.
    pub status: String,
    /// Human-readable reason for the status.
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Provider-side id once created remotely.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Marked for deletion but retained.
    #[serde(default)]
    pub pending_deleted: bool,
    /// Kind-specific attributes (provider, host_id, bandwidth, ...).
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// User-visible metadata (tags).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Resource {
    /// A resource with an empty attribute set.
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            name: name.into(),
            status: status.into(),
            status_reason: None,
            external_id: None,
            pending_deleted: false,
            attributes: Map::new(),
            metadata: Map::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Builder-style external id setter.
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// String attribute, if present.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Partial update applied by [`ResourcePort::update`].
#[derive(Debug, Clone, Default)]
pub struct ResourcePatch {
    /// New external id.
    pub external_id: Option<String>,
    /// Attributes merged over the existing set.
    pub attributes: Map<String, Value>,
    /// New pending-deleted flag.
    pub pending_deleted: Option<bool>,
}

impl ResourcePatch {
    /// Patch that stamps an external id.
    pub fn external_id(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }

    /// Patch that merges attributes.
    pub fn attributes(attributes: Map<String, Value>) -> Self {
        Self {
            attributes,
            ..Default::default()
        }
    }

    /// Add one attribute to the patch.
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Per-resource event stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsLogEntry {
    /// Resource kind.
    pub kind: String,
    /// Resource id.
    pub id: String,
    /// Event name, e.g. `delete_fail`.
    pub action: String,
    /// Free-form note.
    pub note: String,
    /// Acting user.
    pub user_id: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// User-facing audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    /// Resource kind.
    pub kind: String,
    /// Resource id.
    pub id: String,
    /// Operation name, e.g. `delete`.
    pub action: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Message, the raw error on failure.
    pub note: String,
    /// Acting user.
    pub user_id: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Resource persistence and audit trail.
#[async_trait]
pub trait ResourcePort: Send + Sync {
    /// Load a resource; `Ok(None)` when it does not exist.
    async fn fetch(&self, kind: &str, id: &str) -> Result<Option<Resource>, TaskError>;

    /// Resources of `kind` whose attribute `key` equals `value`, ordered by id.
    async fn list_by_attribute(
        &self,
        kind: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<Resource>, TaskError>;

    /// Insert a new resource.
    async fn create(&self, resource: Resource) -> Result<Resource, TaskError>;

    /// Apply a partial update and return the new state.
    async fn update(&self, kind: &str, id: &str, patch: ResourcePatch)
    -> Result<Resource, TaskError>;

    /// Set status and reason. Re-writing the same status is harmless.
    async fn set_status(
        &self,
        kind: &str,
        id: &str,
        status: &str,
        reason: Option<&str>,
    ) -> Result<(), TaskError>;

    /// Remove the local record.
    async fn delete(&self, kind: &str, id: &str) -> Result<(), TaskError>;

    /// Merge user-visible metadata.
    async fn set_metadata(
        &self,
        kind: &str,
        id: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), TaskError>;

    /// Append to the ops-log.
    async fn add_ops_log(&self, entry: OpsLogEntry) -> Result<(), TaskError>;

    /// Append to the action-log.
    async fn add_action_log(&self, entry: ActionLogEntry) -> Result<(), TaskError>;
}

/// Quota reservations.
#[async_trait]
pub trait QuotaPort: Send + Sync {
    /// Release a reservation held by a task. Called once per task.
    async fn release(&self, user_cred: &UserCred, usage: &Value) -> Result<(), TaskError>;

    /// Cancel a sub-reservation the handler no longer needs.
    async fn cancel(&self, user_cred: &UserCred, usage: &Value) -> Result<(), TaskError>;

    /// Detach `portion` from `usage`, returning what remains.
    ///
    /// The default subtracts numeric fields key by key and fails when a
    /// portion exceeds what is reserved.
    fn split(&self, usage: &Value, portion: &Value) -> Result<Value, TaskError> {
        let (Some(usage), Some(portion)) = (usage.as_object(), portion.as_object()) else {
            return Err(TaskError::validation("usage and portion must be objects"));
        };
        let mut remaining = usage.clone();
        for (key, amount) in portion {
            let held = usage.get(key).and_then(Value::as_i64).unwrap_or(0);
            let take = amount
                .as_i64()
                .ok_or_else(|| TaskError::validation(format!("usage '{}' is not numeric", key)))?;
            if take > held {
                return Err(TaskError::validation(format!(
                    "cannot split {} of '{}', only {} reserved",
                    take, key, held
                )));
            }
            remaining.insert(key.clone(), Value::from(held - take));
        }
        Ok(Value::Object(remaining))
    }
}

/// Event delivered through the notification port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    /// Event action, e.g. `ActionCreate`.
    pub action: String,
    /// Resource kind.
    pub kind: String,
    /// Resource id.
    pub id: String,
    /// Resource name.
    pub name: String,
    /// Acting user.
    pub user_id: String,
}

/// Well-known notification actions.
pub mod actions {
    /// A resource was created.
    pub const CREATE: &str = "ActionCreate";
    /// A resource was deleted.
    pub const DELETE: &str = "ActionDelete";
    /// A resource was updated.
    pub const UPDATE: &str = "ActionUpdate";
}

/// Outbound notifications. Delivery failures never fail a task.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    /// Deliver one event.
    async fn notify(&self, event: NotifyEvent) -> Result<(), TaskError>;
}

/// Delivery of a task's terminal body to a parent task in another service.
///
/// The runtime retries failed deliveries a bounded number of times; an
/// implementation makes one attempt per call.
#[async_trait]
pub trait ParentNotifyPort: Send + Sync {
    /// POST `body` to `url`. `parent_id` goes out as `X-Task-Id` when known.
    async fn deliver(
        &self,
        url: &str,
        parent_id: Option<&str>,
        body: &Value,
    ) -> Result<(), TaskError>;
}

/// Held lock; released when dropped.
pub struct LockGuard {
    _inner: Box<dyn Send + Sync>,
}

impl LockGuard {
    /// Wrap any guard value.
    pub fn new<G: Send + Sync + 'static>(guard: G) -> Self {
        Self {
            _inner: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Named locks at well-known contention points.
#[async_trait]
pub trait LockPort: Send + Sync {
    /// Lock a whole class, e.g. name allocation for a resource kind.
    async fn lock_class(&self, class: &str) -> LockGuard;

    /// Lock one object within a class.
    async fn lock_object(&self, class: &str, id: &str) -> LockGuard;
}
