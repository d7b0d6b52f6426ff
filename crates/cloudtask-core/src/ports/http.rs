// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! reqwest-backed [`ParentNotifyPort`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::ParentNotifyPort;
use crate::context::HEADER_TASK_ID;
use crate::error::TaskError;

/// Default per-attempt timeout.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts terminal bodies as JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpParentNotifier {
    client: reqwest::Client,
}

impl HttpParentNotifier {
    /// Notifier whose attempts give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TaskError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaskError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ParentNotifyPort for HttpParentNotifier {
    async fn deliver(
        &self,
        url: &str,
        parent_id: Option<&str>,
        body: &Value,
    ) -> Result<(), TaskError> {
        let mut request = self.client.post(url).json(body);
        if let Some(parent_id) = parent_id {
            request = request.header(HEADER_TASK_ID, parent_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TaskError::timeout(format!("POST {} timed out", url))
            } else {
                TaskError::remote(format!("POST {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        debug!(url = %url, status = %status, "Parent notified");
        if !status.is_success() {
            return Err(TaskError::remote(format!("POST {} returned {}", url, status)));
        }
        Ok(())
    }
}
