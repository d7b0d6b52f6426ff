// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker archiving old terminal tasks.
//!
//! Tasks in `complete` or `failed` whose `finished_at` is older than the
//! retention period are removed in batches, together with their subtask
//! aggregation rows. Non-terminal tasks are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{CoreError, Result};
use crate::persistence::TaskStore;

/// Configuration for the archive worker.
#[derive(Debug, Clone)]
pub struct TaskCleanupWorkerConfig {
    /// Whether archiving runs at all.
    pub enabled: bool,
    /// How often to run a pass.
    pub poll_interval: Duration,
    /// Age after which terminal tasks are removed.
    pub max_age: Duration,
    /// Maximum tasks removed per batch.
    pub batch_size: i64,
}

impl Default for TaskCleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(720 * 3600), // 30 days
            batch_size: 100,
        }
    }
}

impl TaskCleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CLOUDTASK_TASK_ARCHIVE_ENABLED`: "false" or "0" to disable (default: true)
    /// - `CLOUDTASK_TASK_ARCHIVE_POLL_SECS`: seconds between passes (default: 3600)
    /// - `CLOUDTASK_TASK_ARCHIVE_HOURS`: hours before terminal tasks are removed (default: 720)
    /// - `CLOUDTASK_TASK_ARCHIVE_BATCH`: max tasks per batch (default: 100)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("CLOUDTASK_TASK_ARCHIVE_ENABLED")
            .map(|v| !(v == "false" || v == "0"))
            .unwrap_or(defaults.enabled);

        let poll_interval = std::env::var("CLOUDTASK_TASK_ARCHIVE_POLL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let max_age = std::env::var("CLOUDTASK_TASK_ARCHIVE_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .and_then(|hours| hours.checked_mul(3600))
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_age);

        let batch_size = std::env::var("CLOUDTASK_TASK_ARCHIVE_BATCH")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &i64| *n > 0)
            .unwrap_or(defaults.batch_size);

        Self {
            enabled,
            poll_interval,
            max_age,
            batch_size,
        }
    }
}

/// Background worker that removes old terminal tasks.
pub struct TaskCleanupWorker {
    store: Arc<dyn TaskStore>,
    config: TaskCleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl TaskCleanupWorker {
    /// Create a new archive worker.
    pub fn new(store: Arc<dyn TaskStore>, config: TaskCleanupWorkerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Task archive worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.as_secs() / 3600,
            batch_size = self.config.batch_size,
            "Task archive worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task archive worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.archive_once().await {
                        error!(error = %e, "Failed to archive old tasks");
                    }
                }
            }
        }

        info!("Task archive worker stopped");
    }

    /// Run one archive pass. Returns the number of tasks removed.
    pub async fn archive_once(&self) -> Result<u64> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| CoreError::validation("max_age", format!("invalid duration: {}", e)))?;
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .ok_or_else(|| CoreError::validation("max_age", "retention reaches before the epoch"))?;

        let mut total_deleted = 0u64;
        loop {
            let deleted = self
                .store
                .archive_terminal_before(cutoff, self.config.batch_size)
                .await?;
            total_deleted += deleted;

            debug!(
                deleted = deleted,
                total_deleted = total_deleted,
                "Archived batch of tasks"
            );

            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(total_deleted = total_deleted, "Task archive pass completed");
        }
        Ok(total_deleted)
    }
}
