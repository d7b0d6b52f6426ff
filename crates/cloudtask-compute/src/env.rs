// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared environment of the compute kinds and their registration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cloudtask_core::{CoreError, Payload, TaskContext, TaskError, TaskKindRegistry, WaitOptions};

use crate::agent::HostAgent;
use crate::driver::Drivers;
use crate::tasks;

/// Compute-family settings.
#[derive(Debug, Clone)]
pub struct ComputeSettings {
    /// Guests are marked pending-deleted instead of removed unless purged.
    pub pending_delete: bool,
    /// Wait for a remote create to become available.
    pub create_wait: WaitOptions,
    /// Wait for a remote delete to disappear.
    pub delete_wait: WaitOptions,
    /// Wait for a config change to settle.
    pub change_config_wait: WaitOptions,
    /// Wait for a guest playbook to finish.
    pub playbook_wait: WaitOptions,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            pending_delete: false,
            create_wait: WaitOptions::new(Duration::from_secs(5), Duration::from_secs(10 * 60))
                .with_error_statuses(["ERROR", "CREATE_FAILED"]),
            delete_wait: WaitOptions::new(Duration::from_secs(10), Duration::from_secs(10 * 60))
                .with_error_statuses(["ERROR", "DELETE_FAILED"]),
            change_config_wait: WaitOptions::new(
                Duration::from_secs(10),
                Duration::from_secs(2 * 3600),
            )
            .with_error_statuses(["ERROR", "CHANGE_CONFIG_FAILED"]),
            playbook_wait: WaitOptions::new(Duration::from_secs(5), Duration::from_secs(10 * 60))
                .with_error_statuses(["failed"]),
        }
    }
}

impl ComputeSettings {
    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `CLOUDTASK_PENDING_DELETE`: "true" or "1" to retain deleted guests (default: false)
    pub fn from_env() -> Self {
        let pending_delete = std::env::var("CLOUDTASK_PENDING_DELETE")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        Self {
            pending_delete,
            ..Self::default()
        }
    }
}

/// Driver table, host agent and settings shared by every compute handler.
pub struct ComputeEnv {
    /// Provider drivers.
    pub drivers: Drivers,
    /// Host agent client.
    pub agent: Arc<dyn HostAgent>,
    /// Settings.
    pub settings: ComputeSettings,
}

impl std::fmt::Debug for ComputeEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeEnv")
            .field("drivers", &self.drivers)
            .field("agent", &"...")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ComputeEnv {
    /// Bundle the collaborators.
    pub fn new(drivers: Drivers, agent: Arc<dyn HostAgent>, settings: ComputeSettings) -> Self {
        Self {
            drivers,
            agent,
            settings,
        }
    }
}

/// Adapt a handler taking the environment to a stage handler.
pub(crate) fn bind<F, Fut>(
    env: &Arc<ComputeEnv>,
    handler: F,
) -> impl Fn(TaskContext, Payload) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<ComputeEnv>, TaskContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    let env = env.clone();
    move |ctx, payload| handler(env.clone(), ctx, payload)
}

/// Register every compute kind.
pub fn register_all(registry: &mut TaskKindRegistry, env: Arc<ComputeEnv>) -> Result<(), CoreError> {
    for kind in tasks::all_kinds(&env)? {
        registry.register(kind)?;
    }
    Ok(())
}
