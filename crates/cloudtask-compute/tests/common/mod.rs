// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cloudtask-compute integration tests.
//!
//! Provides a [`Harness`] running every compute kind against a scripted
//! driver, a scripted host agent and in-memory ports.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloudtask_compute::{ComputeEnv, ComputeSettings, Drivers, MockDriver, MockHostAgent, register_all};
use cloudtask_core::ports::memory::{InMemoryResources, LocalLocks, RecordingNotifier, RecordingQuota};
use cloudtask_core::{
    MemoryTaskStore, Resource, TaskFilter, TaskKindRegistry, TaskRecord, TaskRuntime,
    TaskRuntimeBuilder, TaskStore, UserCred, WaitOptions,
};

/// Provider name the harness driver answers for.
pub const PROVIDER: &str = "mock";
/// Manager URL of the fixture host.
pub const MANAGER_URL: &str = "http://host-1.test:8885";

/// Runtime plus handles on every collaborator it was built with.
pub struct Harness {
    pub runtime: TaskRuntime,
    pub store: Arc<dyn TaskStore>,
    pub resources: Arc<InMemoryResources>,
    pub quota: Arc<RecordingQuota>,
    pub notifier: Arc<RecordingNotifier>,
    pub driver: Arc<MockDriver>,
    pub agent: Arc<MockHostAgent>,
}

/// Settings with short polls so waits finish in milliseconds.
pub fn fast_settings() -> ComputeSettings {
    let fast = |opts: WaitOptions| WaitOptions {
        poll_interval: Duration::from_millis(10),
        total_timeout: Duration::from_millis(500),
        ..opts
    };
    let defaults = ComputeSettings::default();
    ComputeSettings {
        pending_delete: false,
        create_wait: fast(defaults.create_wait),
        delete_wait: fast(defaults.delete_wait),
        change_config_wait: fast(defaults.change_config_wait),
        playbook_wait: fast(defaults.playbook_wait),
    }
}

impl Harness {
    /// Harness with [`fast_settings`].
    pub async fn new() -> Self {
        Self::with_settings(fast_settings()).await
    }

    /// Harness with the given settings.
    pub async fn with_settings(settings: ComputeSettings) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let resources = Arc::new(InMemoryResources::new());
        let quota = Arc::new(RecordingQuota::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let driver = Arc::new(MockDriver::new(PROVIDER));
        let agent = Arc::new(MockHostAgent::new());

        let env = Arc::new(ComputeEnv::new(
            Drivers::new().with(driver.clone()),
            agent.clone(),
            settings,
        ));
        let mut registry = TaskKindRegistry::new();
        register_all(&mut registry, env).expect("kinds register");

        let runtime = TaskRuntimeBuilder::new()
            .with_store(store.clone())
            .with_registry(registry)
            .with_resources(resources.clone())
            .with_quota(quota.clone())
            .with_notifier(notifier.clone())
            .with_locks(Arc::new(LocalLocks::new()))
            .with_max_concurrent_dispatches(8)
            .with_service_url("http://cloudtask.test")
            .build()
            .expect("runtime config")
            .start()
            .await
            .expect("runtime start");

        Self {
            runtime,
            store,
            resources,
            quota,
            notifier,
            driver,
            agent,
        }
    }

    /// Wait for a task to terminate, failing the test after five seconds.
    pub async fn terminal(&self, task_id: &str) -> TaskRecord {
        self.terminal_within(task_id, Duration::from_secs(5)).await
    }

    /// Wait for a task to terminate within `limit`.
    pub async fn terminal_within(&self, task_id: &str, limit: Duration) -> TaskRecord {
        self.runtime
            .wait_terminal(task_id, limit)
            .await
            .expect("task did not terminate")
    }

    /// Wait until the task reaches `stage`, polling the store.
    pub async fn at_stage(&self, task_id: &str, stage: &str) -> TaskRecord {
        for _ in 0..500 {
            let record = self.store.load(task_id).await.expect("task exists");
            if record.stage == stage {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached stage {}", task_id, stage);
    }

    /// Direct children of `task_id`.
    pub async fn children(&self, task_id: &str) -> Vec<TaskRecord> {
        self.runtime
            .list(&TaskFilter {
                parent_id: Some(task_id.to_string()),
                ..Default::default()
            })
            .await
            .expect("list children")
    }

    /// Insert the fixture host `h-1`.
    pub fn host(&self) -> Resource {
        let host = Resource::new("host", "h-1", "rack-1", "AVAILABLE")
            .with_attr("manager_url", format!("{}/", MANAGER_URL));
        self.resources.insert(host.clone());
        host
    }

    /// Insert a guest on host `h-1`.
    pub fn guest(&self, id: &str, status: &str, hypervisor: &str) -> Resource {
        let guest = Resource::new("guest", id, format!("vm-{}", id), status)
            .with_attr("host_id", "h-1")
            .with_attr("hypervisor", hypervisor);
        self.resources.insert(guest.clone());
        guest
    }

    /// Insert a provider-backed resource, optionally already created remotely.
    pub fn provider_resource(
        &self,
        kind: &str,
        id: &str,
        name: &str,
        external_id: Option<&str>,
    ) -> Resource {
        let mut resource =
            Resource::new(kind, id, name, "AVAILABLE").with_attr("provider", PROVIDER);
        if let Some(external_id) = external_id {
            resource = resource.with_external_id(external_id);
        }
        self.resources.insert(resource.clone());
        resource
    }
}

/// Caller identity used by the suites.
pub fn cred() -> UserCred {
    UserCred::new("u-1", "p-1").with_token("tok-1")
}
