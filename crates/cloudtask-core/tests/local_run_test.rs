// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local jobs and handler-side locking: long waits run off the dispatch
//! permits, their outcome resumes the named stage, cancel aborts them and
//! a handler may re-lock what its dispatch already holds.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use cloudtask_core::ports::status;
use cloudtask_core::{
    ErrorKind, ObjectRef, Payload, Resource, TaskContext, TaskError, TaskKind, TaskKindRegistry,
    TaskSubmission,
};
use common::Harness;

fn registry(kinds: Vec<TaskKind>) -> TaskKindRegistry {
    let mut registry = TaskKindRegistry::new();
    for kind in kinds {
        registry.register(kind).unwrap();
    }
    registry
}

fn quick_kind() -> TaskKind {
    TaskKind::builder("QuickTask")
        .on("OnInit", |mut ctx: TaskContext, _payload: Payload| async move {
            ctx.set_stage_complete(None).await
        })
        .build()
        .unwrap()
}

/// Parks in a local job until `gate` opens, then completes with its data.
fn gated_kind(gate: Arc<watch::Sender<bool>>) -> TaskKind {
    TaskKind::builder("GatedTask")
        .on("OnInit", move |mut ctx: TaskContext, _payload: Payload| {
            let mut open = gate.subscribe();
            async move {
                ctx.run_local("OnWaitDone", async move {
                    open.wait_for(|open| *open)
                        .await
                        .map_err(|_| TaskError::internal("gate dropped"))?;
                    Ok(json!({"status": "AVAILABLE"}))
                })
                .await
            }
        })
        .on("OnWaitDone", |mut ctx: TaskContext, payload: Payload| async move {
            ctx.set_stage_complete(payload.data().cloned()).await
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_pending_local_jobs_do_not_starve_dispatches() {
    let gate = Arc::new(watch::Sender::new(false));
    let h = Harness::new(registry(vec![gated_kind(gate.clone()), quick_kind()])).await;

    // Twice the harness's dispatch permits, all parked in remote waits.
    let mut waiting = Vec::new();
    for _ in 0..16 {
        let id = h.runtime.submit(TaskSubmission::new("GatedTask")).await.unwrap();
        waiting.push(id);
    }
    for id in &waiting {
        h.at_stage(id, "OnWaitDone").await;
    }

    let quick = h.runtime.submit(TaskSubmission::new("QuickTask")).await.unwrap();
    let record = h.terminal(&quick).await;
    assert_eq!(record.stage, "complete");

    gate.send_replace(true);
    for id in &waiting {
        let record = h.terminal(id).await;
        assert_eq!(record.result.unwrap()["status"], "AVAILABLE");
        let history: Vec<_> = record.stage_history.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(history, vec!["init", "OnWaitDone"]);
    }
}

#[tokio::test]
async fn test_local_job_error_reaches_failed_handler() {
    let kind = TaskKind::builder("ConfigTask")
        .on("OnInit", |mut ctx: TaskContext, _payload: Payload| async move {
            ctx.set_status("CHANGE_CONFIG", None).await;
            ctx.run_local("OnConfigChanged", async {
                Err(TaskError::timeout("pool stuck in CHANGING"))
            })
            .await
        })
        .on("OnConfigChangedFailed", |mut ctx: TaskContext, payload: Payload| async move {
            let err = payload
                .error()
                .cloned()
                .unwrap_or_else(|| TaskError::internal("missing reason"));
            ctx.set_status("TIMEOUT", Some(&err.message)).await;
            ctx.set_stage_failed(err).await
        })
        .build()
        .unwrap();
    let h = Harness::new(registry(vec![kind])).await;
    h.resources
        .insert(Resource::new("modelarts_pool", "mp-1", "train", status::AVAILABLE));

    let id = h
        .runtime
        .submit(
            TaskSubmission::new("ConfigTask").object(ObjectRef::single("modelarts_pool", "mp-1")),
        )
        .await
        .unwrap();
    let record = h.terminal(&id).await;

    assert_eq!(record.failure().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(record.result.unwrap()["stage"], "OnConfigChanged");
    assert_eq!(
        h.resources.statuses("modelarts_pool", "mp-1").await,
        vec!["CHANGE_CONFIG", "TIMEOUT"]
    );
}

#[tokio::test]
async fn test_local_job_panic_fails_task() {
    let kind = TaskKind::builder("PanickyWait")
        .on("OnInit", |mut ctx: TaskContext, _payload: Payload| async move {
            ctx.run_local("OnWaitDone", async {
                if true {
                    panic!("poller crashed");
                }
                Ok(json!({}))
            })
            .await
        })
        .build()
        .unwrap();
    let h = Harness::new(registry(vec![kind])).await;

    let id = h.runtime.submit(TaskSubmission::new("PanickyWait")).await.unwrap();
    let record = h.terminal(&id).await;
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Internal);
    assert!(failure.message.contains("poller crashed"), "{}", failure.message);
}

#[tokio::test]
async fn test_cancel_aborts_local_job() {
    let finished = Arc::new(AtomicBool::new(false));
    let kind = {
        let finished = finished.clone();
        TaskKind::builder("LongWait")
            .on("OnInit", move |mut ctx: TaskContext, _payload: Payload| {
                let finished = finished.clone();
                async move {
                    ctx.run_local("OnWaitDone", async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(json!({}))
                    })
                    .await
                }
            })
            .build()
            .unwrap()
    };
    let h = Harness::new(registry(vec![kind])).await;

    let id = h.runtime.submit(TaskSubmission::new("LongWait")).await.unwrap();
    h.at_stage(&id, "OnWaitDone").await;

    h.runtime.cancel(&id).await.unwrap();
    let record = h.terminal(&id).await;
    assert_eq!(record.failure().unwrap().kind, ErrorKind::Cancelled);

    // The aborted job's outcome lands on a terminal task and is dropped.
    tokio::time::timeout(Duration::from_secs(5), h.runtime.wait_idle())
        .await
        .expect("aborted job released its slot");
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(h.store.load(&id).await.unwrap().stage, "failed");
}

#[tokio::test]
async fn test_local_job_dropped_when_handler_fails() {
    let started = Arc::new(AtomicBool::new(false));
    let kind = {
        let started = started.clone();
        TaskKind::builder("BrokenWait")
            .on("OnInit", move |mut ctx: TaskContext, _payload: Payload| {
                let started = started.clone();
                async move {
                    ctx.run_local("OnWaitDone", async move {
                        started.store(true, Ordering::SeqCst);
                        Ok(json!({}))
                    })
                    .await?;
                    Err(TaskError::validation("bad flavor"))
                }
            })
            .build()
            .unwrap()
    };
    let h = Harness::new(registry(vec![kind])).await;

    let id = h.runtime.submit(TaskSubmission::new("BrokenWait")).await.unwrap();
    let record = h.terminal(&id).await;
    h.runtime.wait_idle().await;

    assert_eq!(record.failure().unwrap().message, "bad flavor");
    assert!(!started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_handler_can_lock_its_own_object() {
    let kind = TaskKind::builder("TagSyncTask")
        .on("OnInit", |mut ctx: TaskContext, _payload: Payload| async move {
            let (kind, id) = {
                let object = ctx.object()?;
                (object.kind.clone(), object.id.clone())
            };
            {
                let _guard = ctx.locks().lock_object(&kind, &id).await;
                let _task = ctx.locks().lock_object("tasks", ctx.task_id()).await;
                ctx.ops_log("tags_synced", "").await;
            }
            ctx.set_stage_complete(None).await
        })
        .build()
        .unwrap();
    let h = Harness::new(registry(vec![kind])).await;
    h.resources
        .insert(Resource::new("dns_zone", "dz-1", "example.test", status::AVAILABLE));

    let id = h
        .runtime
        .submit(TaskSubmission::new("TagSyncTask").object(ObjectRef::single("dns_zone", "dz-1")))
        .await
        .unwrap();
    let record = h.terminal(&id).await;

    assert_eq!(record.stage, "complete");
    assert_eq!(h.resources.ops_log().await.len(), 1);
}
