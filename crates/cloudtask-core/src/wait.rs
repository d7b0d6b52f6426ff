// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded polling of remote resource status.
//!
//! Handlers waiting for a provider to settle call [`wait_status`] with a
//! poll interval and an overall budget. Exhausting the budget yields a
//! [`TaskError`] of kind `Timeout`, which the handler maps to a failed
//! terminal like any other error.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::TaskError;

/// A remote object whose status can be refreshed.
#[async_trait]
pub trait RemoteStatus: Send {
    /// Fetch the current state from the remote side.
    async fn refresh(&mut self) -> Result<(), TaskError>;

    /// Status as of the last refresh.
    fn status(&self) -> &str;
}

/// Poll interval, budget and terminal error statuses of one wait.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Delay between refreshes.
    pub poll_interval: Duration,
    /// Overall budget.
    pub total_timeout: Duration,
    /// Statuses that end the wait with an error.
    pub error_statuses: Vec<String>,
}

impl WaitOptions {
    /// Options with no error statuses.
    pub fn new(poll_interval: Duration, total_timeout: Duration) -> Self {
        Self {
            poll_interval,
            total_timeout,
            error_statuses: Vec::new(),
        }
    }

    /// Statuses treated as remote failure.
    pub fn with_error_statuses<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_statuses = statuses.into_iter().map(Into::into).collect();
        self
    }
}

/// Refresh `remote` until its status is one of `targets`.
///
/// Refresh errors end the wait immediately.
pub async fn wait_status<R>(
    remote: &mut R,
    targets: &[&str],
    options: &WaitOptions,
) -> Result<(), TaskError>
where
    R: RemoteStatus + ?Sized,
{
    let deadline = Instant::now() + options.total_timeout;
    loop {
        remote.refresh().await?;
        let status = remote.status();
        if targets.contains(&status) {
            return Ok(());
        }
        if options.error_statuses.iter().any(|s| s == status) {
            return Err(TaskError::remote(format!("remote status {}", status)));
        }
        if Instant::now() >= deadline {
            return Err(TaskError::timeout(format!(
                "status {} not reached within {:?}, last seen {}",
                targets.join("|"),
                options.total_timeout,
                status
            )));
        }
        debug!(status = %status, targets = ?targets, "Waiting for remote status");
        tokio::time::sleep(options.poll_interval).await;
    }
}

/// Refresh `remote` until it reports not-found.
pub async fn wait_deleted<R>(remote: &mut R, options: &WaitOptions) -> Result<(), TaskError>
where
    R: RemoteStatus + ?Sized,
{
    let deadline = Instant::now() + options.total_timeout;
    loop {
        match remote.refresh().await {
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        let status = remote.status();
        if options.error_statuses.iter().any(|s| s == status) {
            return Err(TaskError::remote(format!("remote status {}", status)));
        }
        if Instant::now() >= deadline {
            return Err(TaskError::timeout(format!(
                "resource still present after {:?}, last seen {}",
                options.total_timeout, status
            )));
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}
