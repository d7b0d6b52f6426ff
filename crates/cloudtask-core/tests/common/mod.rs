// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cloudtask-core integration tests.
//!
//! Provides a [`Harness`] wiring a runtime to in-memory ports whose recorded
//! state the tests inspect.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloudtask_core::ports::memory::{
    InMemoryResources, RecordingNotifier, RecordingParentNotifier, RecordingQuota,
};
use cloudtask_core::{
    MemoryTaskStore, TaskKindRegistry, TaskRecord, TaskRuntime, TaskRuntimeBuilder, TaskStore,
};

/// Runtime plus handles on every port it was built with.
pub struct Harness {
    pub runtime: TaskRuntime,
    pub store: Arc<dyn TaskStore>,
    pub resources: Arc<InMemoryResources>,
    pub quota: Arc<RecordingQuota>,
    pub notifier: Arc<RecordingNotifier>,
    pub parent_notifier: Arc<RecordingParentNotifier>,
}

impl Harness {
    /// Harness over an in-memory task store.
    pub async fn new(registry: TaskKindRegistry) -> Self {
        Self::with_store(registry, Arc::new(MemoryTaskStore::new())).await
    }

    /// Harness over the given store.
    pub async fn with_store(registry: TaskKindRegistry, store: Arc<dyn TaskStore>) -> Self {
        Self::build(registry, store, Arc::new(RecordingParentNotifier::new())).await
    }

    /// Harness delivering remote parent notifications to `parent_notifier`.
    pub async fn with_parent_notifier(
        registry: TaskKindRegistry,
        parent_notifier: Arc<RecordingParentNotifier>,
    ) -> Self {
        Self::build(registry, Arc::new(MemoryTaskStore::new()), parent_notifier).await
    }

    async fn build(
        registry: TaskKindRegistry,
        store: Arc<dyn TaskStore>,
        parent_notifier: Arc<RecordingParentNotifier>,
    ) -> Self {
        let resources = Arc::new(InMemoryResources::new());
        let quota = Arc::new(RecordingQuota::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let runtime = TaskRuntimeBuilder::new()
            .with_store(store.clone())
            .with_registry(registry)
            .with_resources(resources.clone())
            .with_quota(quota.clone())
            .with_notifier(notifier.clone())
            .with_parent_notifier(parent_notifier.clone())
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
            parent_notifier,
        }
    }

    /// Wait for a task to terminate, failing the test after five seconds.
    pub async fn terminal(&self, task_id: &str) -> TaskRecord {
        self.runtime
            .wait_terminal(task_id, Duration::from_secs(5))
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
}
