// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider driver port.
//!
//! A [`CloudDriver`] is the per-cloud adapter behind every provider-delegated
//! kind. Drivers are looked up by the `provider` attribute of the resource a
//! task acts on. Optional capabilities default to `NotImplemented` so a
//! driver only overrides what its cloud offers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cloudtask_core::{RemoteStatus, Resource, TaskError};

/// Resource attribute naming the driver.
pub const PROVIDER_ATTR: &str = "provider";

/// State of a resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    /// Provider-side id.
    pub external_id: String,
    /// Provider status, e.g. `CREATING` or `AVAILABLE`.
    pub status: String,
    /// Attributes synced back to the local record.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl RemoteResource {
    /// Remote resource with no attributes.
    pub fn new(external_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            status: status.into(),
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Provider-specific options of a remote create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Local resource kind, e.g. `dns_zone`.
    pub kind: String,
    /// Name requested by the user.
    pub name: String,
    /// Kind-specific settings copied from the resource and task params.
    pub attributes: Map<String, Value>,
}

/// Uniform capability interface of one cloud.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Provider name, matched against the resource `provider` attribute.
    fn provider(&self) -> &str;

    /// Start a remote create; returns as soon as the provider accepted it.
    async fn create(&self, options: &CreateOptions) -> Result<RemoteResource, TaskError>;

    /// Current remote state. Absent resources yield a `NotFound` error.
    async fn get(&self, kind: &str, external_id: &str) -> Result<RemoteResource, TaskError>;

    /// Start a remote delete. Absent resources yield a `NotFound` error.
    async fn delete(&self, kind: &str, external_id: &str) -> Result<(), TaskError>;

    /// Push user tags.
    async fn set_tags(
        &self,
        kind: &str,
        _external_id: &str,
        _tags: &Map<String, Value>,
    ) -> Result<(), TaskError> {
        Err(unsupported(self.provider(), "set_tags", kind))
    }

    /// Change flavour or size.
    async fn change_config(
        &self,
        kind: &str,
        _external_id: &str,
        _config: &Map<String, Value>,
    ) -> Result<(), TaskError> {
        Err(unsupported(self.provider(), "change_config", kind))
    }

    /// Extend a prepaid subscription by `duration`, e.g. `1M`.
    async fn renew(&self, kind: &str, _external_id: &str, _duration: &str) -> Result<(), TaskError> {
        Err(unsupported(self.provider(), "renew", kind))
    }

    /// Switch automatic renewal.
    async fn set_auto_renew(
        &self,
        kind: &str,
        _external_id: &str,
        _enabled: bool,
    ) -> Result<(), TaskError> {
        Err(unsupported(self.provider(), "set_auto_renew", kind))
    }

    /// Rules of a remote security group.
    async fn list_security_rules(&self, _external_id: &str) -> Result<Vec<Value>, TaskError> {
        Err(unsupported(self.provider(), "list_security_rules", "security_group"))
    }

    /// Bind an elastic ip to an instance.
    async fn associate_eip(
        &self,
        _eip_external_id: &str,
        instance_kind: &str,
        _instance_external_id: &str,
    ) -> Result<(), TaskError> {
        Err(unsupported(self.provider(), "associate_eip", instance_kind))
    }
}

fn unsupported(provider: &str, op: &str, kind: &str) -> TaskError {
    TaskError::not_implemented(format!("{} not implemented for {} on {}", op, kind, provider))
}

/// Drivers keyed by provider name.
#[derive(Default, Clone)]
pub struct Drivers {
    drivers: HashMap<String, Arc<dyn CloudDriver>>,
}

impl std::fmt::Debug for Drivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.drivers.keys().collect();
        names.sort();
        f.debug_struct("Drivers").field("providers", &names).finish()
    }
}

impl Drivers {
    /// Empty driver table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver, replacing any with the same provider name.
    pub fn register(&mut self, driver: Arc<dyn CloudDriver>) {
        self.drivers.insert(driver.provider().to_string(), driver);
    }

    /// Builder-style [`Drivers::register`].
    pub fn with(mut self, driver: Arc<dyn CloudDriver>) -> Self {
        self.register(driver);
        self
    }

    /// Driver for a provider name.
    pub fn get(&self, provider: &str) -> Result<Arc<dyn CloudDriver>, TaskError> {
        self.drivers
            .get(provider)
            .cloned()
            .ok_or_else(|| TaskError::not_supported(format!("no driver for provider {}", provider)))
    }

    /// Driver of the cloud a resource lives in.
    pub fn for_resource(&self, resource: &Resource) -> Result<Arc<dyn CloudDriver>, TaskError> {
        let provider = resource.attr_str(PROVIDER_ATTR).ok_or_else(|| {
            TaskError::validation(format!(
                "{} {} has no {} attribute",
                resource.kind, resource.id, PROVIDER_ATTR
            ))
        })?;
        self.get(provider)
    }
}

/// A remote resource polled through its driver.
pub struct RemoteHandle {
    driver: Arc<dyn CloudDriver>,
    kind: String,
    external_id: String,
    last: Option<RemoteResource>,
}

impl RemoteHandle {
    /// Handle on `(kind, external_id)`; nothing is fetched yet.
    pub fn new(
        driver: Arc<dyn CloudDriver>,
        kind: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            kind: kind.into(),
            external_id: external_id.into(),
            last: None,
        }
    }

    /// State seen by the last successful refresh.
    pub fn last(&self) -> Option<&RemoteResource> {
        self.last.as_ref()
    }

    /// Consume the handle, keeping the last state.
    pub fn into_last(self) -> Option<RemoteResource> {
        self.last
    }
}

#[async_trait]
impl RemoteStatus for RemoteHandle {
    async fn refresh(&mut self) -> Result<(), TaskError> {
        self.last = Some(self.driver.get(&self.kind, &self.external_id).await?);
        Ok(())
    }

    fn status(&self) -> &str {
        self.last.as_ref().map(|r| r.status.as_str()).unwrap_or("")
    }
}
