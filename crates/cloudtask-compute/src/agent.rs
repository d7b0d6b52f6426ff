// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host agent port.
//!
//! Guests and baremetal hosts are driven through the agent running on their
//! host. Requests carry the task request header; an agent either answers
//! inline ([`AgentReply::Done`]) or accepts the job and later posts the result
//! to the notify URL of the header ([`AgentReply::Accepted`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cloudtask_core::{RemoteStatus, Resource, ResourcePort, TaskError};

/// Resource kind of hosts.
pub const HOST_KIND: &str = "host";
/// Guest attribute naming its host.
pub const HOST_ID_ATTR: &str = "host_id";
/// Host attribute with the agent base URL.
pub const MANAGER_URL_ATTR: &str = "manager_url";

/// Immediate answer of an agent call.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    /// Job queued; the result arrives as a task callback.
    Accepted,
    /// Job finished inline with this body.
    Done(Value),
}

/// An ephemeral port forward into a guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    /// Forward id, needed to close it.
    pub id: String,
    /// Address to connect to.
    pub address: String,
    /// Port to connect to.
    pub port: u16,
}

/// Calls into a host agent.
#[async_trait]
pub trait HostAgent: Send + Sync {
    /// POST `body` to `url` with the task request header.
    async fn post(
        &self,
        url: &str,
        header: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<AgentReply, TaskError>;

    /// Open a forward to `port` of a guest.
    async fn open_forward(
        &self,
        manager_url: &str,
        guest_id: &str,
        port: u16,
    ) -> Result<Forward, TaskError>;

    /// Close a forward opened by [`HostAgent::open_forward`].
    async fn close_forward(&self, manager_url: &str, forward: &Forward) -> Result<(), TaskError>;

    /// Start a playbook over a forward; returns the playbook id.
    async fn run_playbook(&self, forward: &Forward, playbook: &str) -> Result<String, TaskError>;

    /// Status of a started playbook, e.g. `running`, `succeeded`, `failed`.
    async fn playbook_status(&self, playbook_id: &str) -> Result<String, TaskError>;
}

/// Agent base URL for a host, or for the host a guest runs on.
pub async fn manager_url(
    resources: &dyn ResourcePort,
    resource: &Resource,
) -> Result<String, TaskError> {
    let host = if resource.kind == HOST_KIND {
        resource.clone()
    } else {
        let host_id = resource.attr_str(HOST_ID_ATTR).ok_or_else(|| {
            TaskError::validation(format!("{} {} has no host", resource.kind, resource.id))
        })?;
        resources
            .fetch(HOST_KIND, host_id)
            .await?
            .ok_or_else(|| {
                TaskError::not_found(format!("fail to find {} object {}", HOST_KIND, host_id))
            })?
    };
    host.attr_str(MANAGER_URL_ATTR)
        .map(|url| url.trim_end_matches('/').to_string())
        .ok_or_else(|| TaskError::validation(format!("host {} has no manager url", host.id)))
}

/// A running playbook polled through its agent.
pub struct PlaybookHandle {
    agent: Arc<dyn HostAgent>,
    id: String,
    status: String,
}

impl PlaybookHandle {
    /// Handle on a started playbook.
    pub fn new(agent: Arc<dyn HostAgent>, id: impl Into<String>) -> Self {
        Self {
            agent,
            id: id.into(),
            status: String::new(),
        }
    }

    /// Playbook id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl RemoteStatus for PlaybookHandle {
    async fn refresh(&mut self) -> Result<(), TaskError> {
        self.status = self.agent.playbook_status(&self.id).await?;
        Ok(())
    }

    fn status(&self) -> &str {
        &self.status
    }
}
