// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider-delegated create.
//!
//! `OnInit` resolves the driver from the resource, issues the remote create
//! and stamps the external id. The wait for `AVAILABLE` runs as a local job;
//! `OnRemoteReady` then syncs attributes and tags back and emits the create
//! event. A resource that already carries an external id is resumed at the
//! wait instead of being created again.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use cloudtask_core::ports::actions;
use cloudtask_core::{
    CoreError, Payload, Resource, ResourcePatch, TaskContext, TaskError, TaskKind, WaitOptions,
    wait_status,
};

use super::{fail_with_status, object_of, payload_error, remote_state, settle};
use crate::driver::{CloudDriver, CreateOptions, RemoteHandle, RemoteResource};
use crate::env::{ComputeEnv, bind};
use crate::status::{AVAILABLE, CREATE_FAILED, CREATING};

/// Create kinds and the resource kind each acts on.
pub const CREATE_KINDS: &[(&str, &str)] = &[
    ("DnsZoneCreateTask", "dns_zone"),
    ("CdnDomainCreateTask", "cdn_domain"),
    ("FileSystemCreateTask", "file_system"),
    ("GlobalVpcCreateTask", "global_vpc"),
    ("WafInstanceCreateTask", "waf_instance"),
    ("ModelartsPoolCreateTask", "modelarts_pool"),
    ("KubeNodePoolCreateTask", "kube_node_pool"),
    ("ElasticSearchCreateTask", "elastic_search"),
    ("KafkaCreateTask", "kafka"),
    ("MongoDBCreateTask", "mongodb"),
    ("SecurityGroupCreateTask", "security_group"),
    ("VpcPeeringConnectionCreateTask", "vpc_peering_connection"),
    ("SnapshotPolicyCreateTask", "snapshot_policy"),
    ("LoadbalancerCreateTask", "loadbalancer"),
    ("ElasticipCreateTask", "eip"),
];

/// Remote attribute carrying the provider-side tags.
pub const TAGS_ATTR: &str = "tags";

const READY_STAGE: &str = "OnRemoteReady";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    CREATE_KINDS
        .iter()
        .map(|&(name, resource_kind)| {
            TaskKind::builder(name)
                .on(
                    "OnInit",
                    bind(env, move |env, ctx, payload| {
                        on_init(env, ctx, payload, resource_kind)
                    }),
                )
                .on(
                    READY_STAGE,
                    bind(env, move |env, ctx, payload| {
                        on_remote_ready(env, ctx, payload, resource_kind)
                    }),
                )
                .on("OnRemoteReadyFailed", on_remote_ready_failed)
                .build()
        })
        .collect()
}

async fn on_init(
    env: Arc<ComputeEnv>,
    mut ctx: TaskContext,
    _payload: Payload,
    resource_kind: &'static str,
) -> Result<(), TaskError> {
    let result = start_create(&env, &mut ctx, resource_kind).await;
    settle(&mut ctx, result, CREATE_FAILED, "create").await
}

async fn start_create(
    env: &ComputeEnv,
    ctx: &mut TaskContext,
    resource_kind: &str,
) -> Result<(), TaskError> {
    let object = object_of(ctx, resource_kind)?;
    let (driver, external_id) = issue_create(env, ctx, &object).await?;
    let wait = await_available(driver, &object.kind, external_id, &env.settings.create_wait);
    ctx.run_local(READY_STAGE, wait).await
}

async fn on_remote_ready(
    env: Arc<ComputeEnv>,
    mut ctx: TaskContext,
    payload: Payload,
    resource_kind: &'static str,
) -> Result<(), TaskError> {
    let result = finish_create(&env, &mut ctx, &payload, resource_kind).await;
    settle(&mut ctx, result, CREATE_FAILED, "create").await
}

async fn finish_create(
    env: &ComputeEnv,
    ctx: &mut TaskContext,
    payload: &Payload,
    resource_kind: &str,
) -> Result<(), TaskError> {
    let object = object_of(ctx, resource_kind)?;
    let external_id = apply_remote_state(env, ctx, &object, remote_state(payload)?).await?;

    ctx.set_status(AVAILABLE, None).await;
    ctx.notify(actions::CREATE).await;
    ctx.action_log("create", true, "").await;
    ctx.set_stage_complete(Some(json!({
        "id": object.id,
        "name": object.name,
        "external_id": external_id,
    })))
    .await
}

async fn on_remote_ready_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    fail_with_status(&mut ctx, CREATE_FAILED, "create", payload_error(&payload)).await
}

/// Issue the remote create of `object` and stamp its external id.
///
/// Skips the create call when the object already carries an external id.
pub(crate) async fn issue_create(
    env: &ComputeEnv,
    ctx: &TaskContext,
    object: &Resource,
) -> Result<(Arc<dyn CloudDriver>, String), TaskError> {
    let driver = env.drivers.for_resource(object)?;

    if let Some(id) = &object.external_id {
        info!(
            task_id = %ctx.task_id(),
            object_id = %object.id,
            external_id = %id,
            "Remote create already issued, resuming wait"
        );
        return Ok((driver, id.clone()));
    }

    ctx.set_status(CREATING, None).await;
    let mut attributes = object.attributes.clone();
    for (k, v) in ctx.params() {
        attributes.insert(k.clone(), v.clone());
    }
    let remote = driver
        .create(&CreateOptions {
            kind: object.kind.clone(),
            name: object.name.clone(),
            attributes,
        })
        .await?;
    ctx.resources()
        .update(
            &object.kind,
            &object.id,
            ResourcePatch::external_id(&remote.external_id),
        )
        .await?;
    info!(
        task_id = %ctx.task_id(),
        object_id = %object.id,
        external_id = %remote.external_id,
        "Remote create issued"
    );
    Ok((driver, remote.external_id))
}

/// Local job polling `(kind, external_id)` until `AVAILABLE`.
///
/// Yields the last remote state for the continuation stage.
pub(crate) fn await_available(
    driver: Arc<dyn CloudDriver>,
    kind: &str,
    external_id: String,
    wait: &WaitOptions,
) -> impl Future<Output = Result<Value, TaskError>> + Send + 'static {
    let kind = kind.to_string();
    let wait = wait.clone();
    async move {
        let mut remote = RemoteHandle::new(driver, kind, external_id);
        wait_status(&mut remote, &[AVAILABLE], &wait).await?;
        match remote.into_last() {
            Some(state) => serde_json::to_value(state)
                .map_err(|e| TaskError::internal(format!("remote state: {}", e))),
            None => Ok(Value::Null),
        }
    }
}

/// Sync the remote state reached by [`await_available`] back to `object`.
///
/// Attributes are patched onto the record, provider-side tags the user
/// has not set are adopted as metadata and user metadata is pushed as
/// remote tags. Returns the external id.
pub(crate) async fn apply_remote_state(
    env: &ComputeEnv,
    ctx: &TaskContext,
    object: &Resource,
    state: Option<RemoteResource>,
) -> Result<String, TaskError> {
    let external_id = match (&state, &object.external_id) {
        (Some(state), _) => state.external_id.clone(),
        (None, Some(id)) => id.clone(),
        (None, None) => {
            return Err(TaskError::internal(format!(
                "{} {} has no external id after create",
                object.kind, object.id
            )));
        }
    };
    let mut attributes = state.map(|s| s.attributes).unwrap_or_default();

    let remote_tags = match attributes.remove(TAGS_ATTR) {
        Some(Value::Object(tags)) => tags,
        _ => Map::new(),
    };
    if !attributes.is_empty() {
        ctx.resources()
            .update(&object.kind, &object.id, ResourcePatch::attributes(attributes))
            .await?;
    }

    let adopted: Map<String, Value> = remote_tags
        .into_iter()
        .filter(|(k, _)| !object.metadata.contains_key(k))
        .collect();
    if !adopted.is_empty() {
        ctx.resources()
            .set_metadata(&object.kind, &object.id, adopted.clone())
            .await?;
    }

    if !object.metadata.is_empty() {
        let mut tags = adopted;
        tags.extend(object.metadata.clone());
        let driver = env.drivers.for_resource(object)?;
        sync_tags(driver.as_ref(), ctx, object, &external_id, &tags).await?;
    }
    Ok(external_id)
}

/// Push `tags` to the remote; missing support is only logged.
async fn sync_tags(
    driver: &dyn CloudDriver,
    ctx: &TaskContext,
    object: &Resource,
    external_id: &str,
    tags: &Map<String, Value>,
) -> Result<(), TaskError> {
    match driver.set_tags(&object.kind, external_id, tags).await {
        Err(e) if e.is_unsupported() => {
            warn!(
                task_id = %ctx.task_id(),
                object_id = %object.id,
                provider = %driver.provider(),
                error = %e,
                "Tag sync skipped"
            );
            Ok(())
        }
        other => other,
    }
}
