// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end flows through the compute kinds: provider create and delete,
//! account fan-out, baremetal guest sync, config-change timeout, long waits
//! beside short tasks and pending delete.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use cloudtask_compute::{AgentReply, ComputeSettings, RemoteResource};
use cloudtask_core::ports::actions;
use cloudtask_core::{ErrorKind, ObjectRef, Outcome, Resource, TaskError, TaskSubmission};
use common::{Harness, PROVIDER, cred, fast_settings};

#[tokio::test]
async fn test_dns_zone_create_waits_for_available() {
    let h = Harness::new().await;
    h.resources.insert(
        Resource::new("dns_zone", "dz-1", "example.test", "READY").with_attr("provider", PROVIDER),
    );
    h.driver
        .script_create("example.test", "z-1", &["CREATING", "CREATING", "AVAILABLE"]);

    let id = h
        .runtime
        .submit(
            TaskSubmission::new("DnsZoneCreateTask")
                .object(ObjectRef::single("dns_zone", "dz-1").named("example.test"))
                .user_cred(cred()),
        )
        .await
        .unwrap();
    let record = h.terminal(&id).await;

    assert_eq!(record.outcome(), Some(Outcome::Complete));
    assert_eq!(record.result.as_ref().unwrap()["external_id"], "z-1");
    assert_eq!(h.driver.call_count("create").await, 1);
    assert_eq!(h.driver.call_count("get").await, 3);

    let zone = h.resources.get("dns_zone", "dz-1").unwrap();
    assert_eq!(zone.status, "AVAILABLE");
    assert_eq!(zone.external_id.as_deref(), Some("z-1"));
    assert_eq!(
        h.resources.statuses("dns_zone", "dz-1").await,
        vec!["CREATING", "AVAILABLE"]
    );
    assert_eq!(h.notifier.count(actions::CREATE).await, 1);

    let log = h.resources.action_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, "create");
    assert!(log[0].success);
    assert_eq!(log[0].user_id, "u-1");
}

#[tokio::test]
async fn test_kafka_delete_with_remote_already_gone() {
    let h = Harness::new().await;
    h.provider_resource("kafka", "k-1", "events", Some("kafka-ext-1"));

    let id = h
        .runtime
        .submit(TaskSubmission::new("KafkaDeleteTask").object(ObjectRef::single("kafka", "k-1")))
        .await
        .unwrap();
    let record = h.terminal(&id).await;

    assert_eq!(record.outcome(), Some(Outcome::Complete));
    assert!(h.resources.get("kafka", "k-1").is_none());
    assert_eq!(h.driver.call_count("delete").await, 0);
    assert_eq!(h.notifier.count(actions::DELETE).await, 1);
}

#[tokio::test]
async fn test_cloud_account_delete_fails_when_one_provider_fails() {
    let h = Harness::new().await;
    h.resources
        .insert(Resource::new("cloudaccount", "ca-1", "acme", "AVAILABLE"));
    for n in 1..=3 {
        let external_id = format!("ext-cp-{}", n);
        h.resources.insert(
            Resource::new("cloudprovider", format!("cp-{}", n), format!("region-{}", n), "AVAILABLE")
                .with_attr("provider", PROVIDER)
                .with_attr("cloudaccount_id", "ca-1")
                .with_external_id(&external_id),
        );
        h.driver
            .insert_remote("cloudprovider", RemoteResource::new(&external_id, "AVAILABLE"));
    }
    h.driver
        .fail_on("delete", "ext-cp-2", TaskError::remote("auth denied"));

    let id = h
        .runtime
        .submit(
            TaskSubmission::new("CloudAccountDeleteTask")
                .object(ObjectRef::single("cloudaccount", "ca-1")),
        )
        .await
        .unwrap();
    let record = h.terminal(&id).await;
    h.runtime.wait_idle().await;

    assert_eq!(record.outcome(), Some(Outcome::Failed));
    let failure = record.failure().unwrap();
    assert!(failure.message.contains("auth denied"), "{}", failure.message);

    let account = h.resources.get("cloudaccount", "ca-1").unwrap();
    assert_eq!(account.status, "DELETE_FAILED");

    assert!(h.resources.get("cloudprovider", "cp-1").is_none());
    assert!(h.resources.get("cloudprovider", "cp-3").is_none());
    let survivor = h.resources.get("cloudprovider", "cp-2").unwrap();
    assert_eq!(survivor.status, "DELETE_FAILED");
    assert_eq!(survivor.status_reason.as_deref(), Some("auth denied"));

    let children = h.children(&id).await;
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.is_terminal()));
}

#[tokio::test]
async fn test_baremetal_sync_all_guests() {
    let h = Harness::new().await;
    h.host();
    h.guest("g-1", "UNKNOWN", "baremetal");
    h.guest("g-2", "UNKNOWN", "BareMetal");
    h.guest("g-3", "running", "baremetal");
    h.guest("g-4", "UNKNOWN", "kvm");
    h.agent
        .reply_on("/status", AgentReply::Done(json!({"status": "running"})));

    let id = h
        .runtime
        .submit(
            TaskSubmission::new("BaremetalSyncAllGuestsStatusTask")
                .object(ObjectRef::single("host", "h-1")),
        )
        .await
        .unwrap();
    let record = h.terminal(&id).await;

    assert_eq!(record.outcome(), Some(Outcome::Complete));
    assert_eq!(record.result.as_ref().unwrap()["total"], 2);

    for guest in ["g-1", "g-2"] {
        assert_eq!(
            h.resources.statuses("guest", guest).await,
            vec!["SYNCING_STATUS", "running"]
        );
    }
    assert!(h.resources.statuses("guest", "g-3").await.is_empty());
    assert!(h.resources.statuses("guest", "g-4").await.is_empty());

    let posts = h.agent.posts().await;
    assert_eq!(posts.len(), 2);
    for post in &posts {
        assert!(post.url.starts_with("http://host-1.test:8885/servers/g-"));
        assert!(post.url.ends_with("/status"));
        assert_eq!(post.header["X-Task-Stage"], "OnGetStatusComplete");
    }
}

#[tokio::test]
async fn test_baremetal_sync_with_no_unknown_guests_completes() {
    let h = Harness::new().await;
    h.host();
    h.guest("g-1", "running", "baremetal");

    let id = h
        .runtime
        .submit(
            TaskSubmission::new("BaremetalSyncAllGuestsStatusTask")
                .object(ObjectRef::single("host", "h-1")),
        )
        .await
        .unwrap();
    let record = h.terminal(&id).await;

    assert_eq!(record.outcome(), Some(Outcome::Complete));
    assert_eq!(record.result, Some(json!({"total": 0})));
    assert!(h.children(&id).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_modelarts_change_config_times_out() {
    let h = Harness::with_settings(ComputeSettings::default()).await;
    h.provider_resource("modelarts_pool", "mp-1", "train", Some("pool-1"));
    h.driver
        .insert_remote("modelarts_pool", RemoteResource::new("pool-1", "AVAILABLE"));
    h.driver.script_change("pool-1", &["CHANGING"]);

    let started = Instant::now();
    let id = h
        .runtime
        .submit(
            TaskSubmission::new("ModelartsPoolChangeConfigTask")
                .object(ObjectRef::single("modelarts_pool", "mp-1"))
                .param("config", json!({"nodes": 4})),
        )
        .await
        .unwrap();
    let record = h.terminal_within(&id, Duration::from_secs(3 * 3600)).await;

    // Two hours of polling every ten seconds, all on the paused clock.
    assert!(started.elapsed() >= Duration::from_secs(2 * 3600));
    assert_eq!(record.outcome(), Some(Outcome::Failed));
    assert_eq!(record.failure().unwrap().kind, ErrorKind::Timeout);

    let pool = h.resources.get("modelarts_pool", "mp-1").unwrap();
    assert_eq!(pool.status, "TIMEOUT");
    assert_eq!(
        h.resources.statuses("modelarts_pool", "mp-1").await,
        vec!["CHANGE_CONFIG", "TIMEOUT"]
    );
    assert!(
        h.resources
            .ops_log()
            .await
            .iter()
            .any(|e| e.action == "change_config_fail")
    );
}

#[tokio::test]
async fn test_stuck_config_changes_leave_room_for_other_tasks() {
    let h = Harness::with_settings(ComputeSettings::default()).await;
    let mut pools = Vec::new();
    // More pools stuck in CHANGING than the harness has dispatch permits.
    for n in 1..=10 {
        let pool = format!("mp-{}", n);
        let external_id = format!("pool-{}", n);
        h.provider_resource("modelarts_pool", &pool, "train", Some(&external_id));
        h.driver
            .insert_remote("modelarts_pool", RemoteResource::new(&external_id, "AVAILABLE"));
        h.driver.script_change(&external_id, &["CHANGING"]);
        let id = h
            .runtime
            .submit(
                TaskSubmission::new("ModelartsPoolChangeConfigTask")
                    .object(ObjectRef::single("modelarts_pool", &pool))
                    .param("config", json!({"nodes": 2})),
            )
            .await
            .unwrap();
        pools.push(id);
    }
    for id in &pools {
        h.at_stage(id, "OnConfigChanged").await;
    }

    h.provider_resource("kafka", "k-1", "events", Some("kafka-ext-1"));
    let id = h
        .runtime
        .submit(TaskSubmission::new("KafkaDeleteTask").object(ObjectRef::single("kafka", "k-1")))
        .await
        .unwrap();
    let record = h.terminal(&id).await;
    assert_eq!(record.outcome(), Some(Outcome::Complete));

    for id in &pools {
        h.runtime.cancel(id).await.unwrap();
        let record = h.terminal(id).await;
        assert_eq!(record.failure().unwrap().kind, ErrorKind::Cancelled);
    }
}

#[tokio::test]
async fn test_guest_pending_delete_retains_guest() {
    let mut settings = fast_settings();
    settings.pending_delete = true;
    let h = Harness::with_settings(settings).await;
    h.host();
    h.guest("g-1", "ready", "kvm");
    h.agent
        .reply_on("/status", AgentReply::Done(json!({"status": "ready"})));

    let id = h
        .runtime
        .submit(TaskSubmission::new("GuestDeleteTask").object(ObjectRef::single("guest", "g-1")))
        .await
        .unwrap();
    let record = h.terminal(&id).await;

    assert_eq!(record.outcome(), Some(Outcome::Complete));
    let guest = h.resources.get("guest", "g-1").unwrap();
    assert!(guest.pending_deleted);
    assert_eq!(
        h.resources.statuses("guest", "g-1").await,
        vec!["PENDING_DELETE", "SYNCING_STATUS", "ready"]
    );

    let children = h.children(&id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].kind, "GuestSyncstatusTask");
    assert_eq!(children[0].outcome(), Some(Outcome::Complete));

    assert_eq!(h.notifier.count(actions::DELETE).await, 0);
    assert!(
        h.resources
            .ops_log()
            .await
            .iter()
            .any(|e| e.action == "pending_delete")
    );
    assert!(
        h.agent
            .posts()
            .await
            .iter()
            .all(|p| !p.url.ends_with("/delete"))
    );
}
