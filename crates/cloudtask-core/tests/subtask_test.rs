// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parent/child signalling, progress, remote parents, cancellation cascade,
//! quota release and restart recovery.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use cloudtask_core::ports::memory::RecordingParentNotifier;
use cloudtask_core::{
    ErrorKind, ObjectRef, Payload, Resource, SqliteTaskStore, TaskContext, TaskError, TaskKind,
    TaskKindRegistry, TaskRecord, TaskSubmission, UserCred,
};
use common::Harness;

/// Child completing or failing on its `fail` parameter.
fn child_kind() -> TaskKind {
    TaskKind::builder("ChildTask")
        .on("OnInit", |mut ctx: TaskContext, _payload: Payload| async move {
            if let Some(reason) = ctx.param_str("fail") {
                return Err(TaskError::remote(reason));
            }
            let n = ctx.params().get("n").cloned().unwrap_or_default();
            ctx.set_stage_complete(Some(json!({"n": n}))).await
        })
        .build()
        .unwrap()
}

/// Child that parks at `OnRemote` until a callback arrives.
fn waiter_kind() -> TaskKind {
    TaskKind::builder("WaiterTask")
        .on("OnInit", |mut ctx: TaskContext, _payload: Payload| async move {
            ctx.set_stage("OnRemote", None).await
        })
        .build()
        .unwrap()
}

/// Parent fanning out `count` children to `OnChildrenDone`.
fn parent_kind(signals: Arc<AtomicUsize>) -> TaskKind {
    TaskKind::builder("ParentTask")
        .on("OnInit", |mut ctx: TaskContext, _payload: Payload| async move {
            let count = ctx.params().get("count").and_then(|v| v.as_u64()).unwrap_or(0);
            let child_kind = ctx.param_str("child").unwrap_or("ChildTask").to_string();
            let fail_index = ctx.params().get("fail_index").and_then(|v| v.as_u64());
            let children = (0..count)
                .map(|i| {
                    let child = TaskSubmission::new(child_kind.clone()).param("n", i);
                    if Some(i) == fail_index {
                        child.param("fail", "auth denied")
                    } else {
                        child
                    }
                })
                .collect();
            ctx.submit_children("OnChildrenDone", children).await?;
            Ok(())
        })
        .on("OnChildrenDone", move |mut ctx: TaskContext, payload: Payload| {
            let signals = signals.clone();
            async move {
                signals.fetch_add(1, Ordering::SeqCst);
                ctx.set_stage_complete(payload.data().cloned()).await
            }
        })
        .build()
        .unwrap()
}

fn registry(signals: Arc<AtomicUsize>) -> TaskKindRegistry {
    let mut registry = TaskKindRegistry::new();
    registry.register(child_kind()).unwrap();
    registry.register(waiter_kind()).unwrap();
    registry.register(parent_kind(signals)).unwrap();
    registry
}

#[tokio::test]
async fn test_parent_signalled_once_after_all_children() {
    let signals = Arc::new(AtomicUsize::new(0));
    let h = Harness::new(registry(signals.clone())).await;

    let parent = h
        .runtime
        .submit(TaskSubmission::new("ParentTask").param("count", 6))
        .await
        .unwrap();

    let record = h.terminal(&parent).await;
    h.runtime.wait_idle().await;

    assert_eq!(record.stage, "complete");
    assert_eq!(signals.load(Ordering::SeqCst), 1);
    let result = record.result.unwrap();
    assert_eq!(result["total"], 6);
    assert_eq!(result["succeeded"], 6);

    let summary = h.runtime.subtasks(&parent, "OnChildrenDone").await.unwrap();
    assert_eq!(summary.pending(), 0);
    assert_eq!(summary.progress(), 100.0);
}

#[tokio::test]
async fn test_single_child_result_passes_through() {
    let signals = Arc::new(AtomicUsize::new(0));
    let h = Harness::new(registry(signals.clone())).await;

    let parent = h
        .runtime
        .submit(TaskSubmission::new("ParentTask").param("count", 1))
        .await
        .unwrap();

    let record = h.terminal(&parent).await;
    assert_eq!(record.result.unwrap(), json!({"n": 0}));
}

#[tokio::test]
async fn test_child_failure_propagates_to_parent() {
    let signals = Arc::new(AtomicUsize::new(0));
    let h = Harness::new(registry(signals.clone())).await;

    let parent = h
        .runtime
        .submit(
            TaskSubmission::new("ParentTask")
                .param("count", 4)
                .param("fail_index", 2),
        )
        .await
        .unwrap();

    let record = h.terminal(&parent).await;
    h.runtime.wait_idle().await;

    assert_eq!(record.stage, "failed");
    assert_eq!(signals.load(Ordering::SeqCst), 0);
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Remote);
    assert!(failure.message.contains("auth denied"));
    assert_eq!(failure.details.unwrap()["failed"], 1);
}

#[tokio::test]
async fn test_parent_progress_recorded_per_child() {
    let signals = Arc::new(AtomicUsize::new(0));
    let h = Harness::new(registry(signals.clone())).await;

    let parent = h
        .runtime
        .submit(
            TaskSubmission::new("ParentTask")
                .param("count", 2)
                .param("child", "WaiterTask"),
        )
        .await
        .unwrap();
    h.at_stage(&parent, "OnChildrenDone").await;
    h.runtime.wait_idle().await;
    assert_eq!(h.store.load(&parent).await.unwrap().progress, 0.0);

    let children = h
        .runtime
        .list(&cloudtask_core::TaskFilter {
            parent_id: Some(parent.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 2);

    h.runtime.cancel(&children[0].id).await.unwrap();
    h.terminal(&children[0].id).await;
    h.runtime.wait_idle().await;

    let record = h.store.load(&parent).await.unwrap();
    assert_eq!(record.stage, "OnChildrenDone");
    assert_eq!(record.progress, 50.0);

    h.runtime.cancel(&children[1].id).await.unwrap();
    let record = h.terminal(&parent).await;
    assert_eq!(record.progress, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_parent_notified_after_retries() {
    let notifier = Arc::new(RecordingParentNotifier::failing_first(2));
    let h = Harness::with_parent_notifier(registry(Arc::new(AtomicUsize::new(0))), notifier.clone())
        .await;

    let id = h
        .runtime
        .submit(
            TaskSubmission::new("ChildTask")
                .param("n", 7)
                .parent_notify_url("http://region-2.test/tasks/p-1")
                .remote_parent_id("p-1"),
        )
        .await
        .unwrap();
    let record = h.terminal(&id).await;
    h.runtime.wait_idle().await;

    assert_eq!(record.stage, "complete");
    let attempts = notifier.attempts().await;
    assert_eq!(attempts.len(), 3);
    for attempt in &attempts {
        assert_eq!(attempt.url, "http://region-2.test/tasks/p-1");
        assert_eq!(attempt.parent_id.as_deref(), Some("p-1"));
        assert_eq!(attempt.body, json!({"n": 7}));
    }
}

#[tokio::test(start_paused = true)]
async fn test_remote_parent_notification_gives_up() {
    let notifier = Arc::new(RecordingParentNotifier::failing_first(usize::MAX));
    let h = Harness::with_parent_notifier(registry(Arc::new(AtomicUsize::new(0))), notifier.clone())
        .await;

    let id = h
        .runtime
        .submit(
            TaskSubmission::new("ChildTask")
                .param("fail", "no capacity")
                .parent_notify_url("http://region-2.test/tasks/p-1"),
        )
        .await
        .unwrap();
    let record = h.terminal(&id).await;
    h.runtime.wait_idle().await;

    assert_eq!(record.stage, "failed");
    let attempts = notifier.attempts().await;
    assert_eq!(attempts.len(), 5);
    let body = &attempts[0].body;
    assert_eq!(body["__status__"], "error");
    assert_eq!(body["__task_name__"], "ChildTask");
    assert!(!body["__reason__"].is_null());
    assert_eq!(attempts[0].parent_id, None);
}

#[tokio::test]
async fn test_cancel_cascades_to_children() {
    let signals = Arc::new(AtomicUsize::new(0));
    let h = Harness::new(registry(signals.clone())).await;

    let parent = h
        .runtime
        .submit(
            TaskSubmission::new("ParentTask")
                .param("count", 3)
                .param("child", "WaiterTask"),
        )
        .await
        .unwrap();
    h.at_stage(&parent, "OnChildrenDone").await;
    h.runtime.wait_idle().await;

    let children = h
        .runtime
        .list(&cloudtask_core::TaskFilter {
            parent_id: Some(parent.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 3);

    h.runtime.cancel(&parent).await.unwrap();

    let record = h.terminal(&parent).await;
    assert_eq!(record.failure().unwrap().kind, ErrorKind::Cancelled);
    for child in children {
        let child = h.terminal(&child.id).await;
        assert_eq!(child.failure().unwrap().kind, ErrorKind::Cancelled);
    }
    h.runtime.wait_idle().await;
    assert_eq!(signals.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pending_usage_released_exactly_once() {
    let mut registry = registry(Arc::new(AtomicUsize::new(0)));
    registry
        .register(
            TaskKind::builder("PanicTask")
                .on("OnInit", |ctx: TaskContext, _payload: Payload| async move {
                    if ctx.param_bool("explode") {
                        panic!("handler bug");
                    }
                    Ok(())
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = Harness::new(registry).await;
    let cred = UserCred::new("u-1", "p-1");

    let submissions = vec![
        TaskSubmission::new("ChildTask"),
        TaskSubmission::new("ChildTask").param("fail", "no capacity"),
        TaskSubmission::new("PanicTask").param("explode", true),
        TaskSubmission::new("WaiterTask"),
    ];

    let mut ids = Vec::new();
    for submission in submissions {
        let usage = h.quota.reserve(&cred, &json!({"eip": 1}));
        let id = h
            .runtime
            .submit(submission.user_cred(cred.clone()).pending_usage(usage))
            .await
            .unwrap();
        ids.push(id);
    }

    h.at_stage(&ids[3], "OnRemote").await;
    h.runtime.cancel(&ids[3]).await.unwrap();

    for id in &ids {
        h.terminal(id).await;
    }
    h.runtime.wait_idle().await;

    // Late payloads after termination must not release again.
    h.runtime
        .dispatch(&ids[0], Payload::Failure(TaskError::remote("late")), None)
        .await
        .unwrap();

    assert_eq!(h.quota.reserve_count(), 4);
    assert_eq!(h.quota.release_count(), 4);
    let releases = h.quota.releases().await;
    assert!(releases.iter().all(|(project, _)| project == "p-1"));
}

#[tokio::test]
async fn test_recovery_fails_interrupted_tasks() {
    let mut registry = TaskKindRegistry::new();
    registry
        .register(
            TaskKind::builder("DnsZoneCreateTask")
                .on("OnRemoteFailed", |mut ctx: TaskContext, payload: Payload| async move {
                    ctx.set_status("CREATE_FAILED", None).await;
                    let err = payload
                        .error()
                        .cloned()
                        .unwrap_or_else(|| TaskError::internal("missing reason"));
                    ctx.set_stage_failed(err).await
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = Harness::new(registry).await;
    h.resources
        .insert(Resource::new("dns_zone", "z-1", "example.org", "CREATING"));

    // Left behind by a previous process.
    let mut interrupted = TaskRecord::new("DnsZoneCreateTask");
    interrupted.stage = "OnRemote".to_string();
    interrupted.object = Some(ObjectRef::single("dns_zone", "z-1"));
    h.store.create(&interrupted).await.unwrap();

    let mut finished = TaskRecord::new("DnsZoneCreateTask");
    finished.object = Some(ObjectRef::single("dns_zone", "z-1"));
    h.store.create(&finished).await.unwrap();
    h.store
        .terminate(&finished.id, cloudtask_core::Outcome::Complete, &json!({}))
        .await
        .unwrap();

    assert_eq!(h.runtime.recover_incomplete().await.unwrap(), 1);

    let record = h.terminal(&interrupted.id).await;
    assert_eq!(record.failure().unwrap().message, "service restart");
    assert_eq!(h.resources.get("dns_zone", "z-1").unwrap().status, "CREATE_FAILED");
    assert_eq!(h.store.load(&finished.id).await.unwrap().stage, "complete");
}

#[tokio::test]
async fn test_fan_out_on_sqlite_store() {
    let store = SqliteTaskStore::connect("sqlite::memory:").await.unwrap();
    let signals = Arc::new(AtomicUsize::new(0));
    let h = Harness::with_store(registry(signals.clone()), Arc::new(store)).await;

    let parent = h
        .runtime
        .submit(
            TaskSubmission::new("ParentTask")
                .param("count", 4)
                .user_cred(UserCred::new("u-9", "p-9")),
        )
        .await
        .unwrap();

    let record = h.terminal(&parent).await;
    h.runtime.wait_idle().await;

    assert_eq!(record.stage, "complete");
    assert_eq!(signals.load(Ordering::SeqCst), 1);
    assert_eq!(record.stage_history.len(), 2);

    let children = h
        .runtime
        .list(&cloudtask_core::TaskFilter {
            parent_id: Some(parent.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 4);
    assert!(children.iter().all(|c| c.user_cred.project_id == "p-9"));
    assert!(children.iter().all(|c| c.stage == "complete"));
}
