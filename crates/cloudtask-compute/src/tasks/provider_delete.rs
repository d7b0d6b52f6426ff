// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider-delegated delete.
//!
//! Idempotent: a remote that is already gone counts as deleted. The `purge`
//! parameter skips the remote side altogether. The wait for the remote to
//! disappear runs as a local job resumed at `OnRemoteDeleted`.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use cloudtask_core::ports::actions;
use cloudtask_core::{CoreError, Payload, Resource, TaskContext, TaskError, TaskKind, wait_deleted};

use super::{fail_with_status, object_of, payload_error, settle};
use crate::driver::RemoteHandle;
use crate::env::{ComputeEnv, bind};
use crate::status::{DELETE_FAILED, DELETING};

/// Delete kinds and the resource kind each acts on.
pub const DELETE_KINDS: &[(&str, &str)] = &[
    ("DnsZoneDeleteTask", "dns_zone"),
    ("CdnDomainDeleteTask", "cdn_domain"),
    ("FileSystemDeleteTask", "file_system"),
    ("GlobalVpcDeleteTask", "global_vpc"),
    ("WafInstanceDeleteTask", "waf_instance"),
    ("ModelartsPoolDeleteTask", "modelarts_pool"),
    ("KubeNodePoolDeleteTask", "kube_node_pool"),
    ("ElasticSearchDeleteTask", "elastic_search"),
    ("KafkaDeleteTask", "kafka"),
    ("MongoDBDeleteTask", "mongodb"),
    ("SecurityGroupDeleteTask", "security_group"),
    ("VpcPeeringConnectionDeleteTask", "vpc_peering_connection"),
    ("SnapshotPolicyDeleteTask", "snapshot_policy"),
    ("LoadbalancerDeleteTask", "loadbalancer"),
    ("ElasticipDeleteTask", "eip"),
    ("CloudProviderDeleteTask", "cloudprovider"),
];

const DELETED_STAGE: &str = "OnRemoteDeleted";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    DELETE_KINDS
        .iter()
        .map(|&(name, resource_kind)| {
            TaskKind::builder(name)
                .on(
                    "OnInit",
                    bind(env, move |env, ctx, payload| {
                        on_init(env, ctx, payload, resource_kind)
                    }),
                )
                .on(DELETED_STAGE, move |ctx, _payload| on_remote_deleted(ctx, resource_kind))
                .on("OnRemoteDeletedFailed", on_remote_delete_failed)
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
    let result = delete(&env, &mut ctx, resource_kind).await;
    settle(&mut ctx, result, DELETE_FAILED, "delete").await
}

async fn delete(
    env: &ComputeEnv,
    ctx: &mut TaskContext,
    resource_kind: &str,
) -> Result<(), TaskError> {
    let object = object_of(ctx, resource_kind)?;

    if ctx.param_bool("purge") {
        info!(task_id = %ctx.task_id(), object_id = %object.id, "Purge requested, remote left untouched");
        return delete_local(ctx, &object).await;
    }

    match issue_delete(env, ctx, &object).await? {
        Some(remote) => {
            let wait = env.settings.delete_wait.clone();
            ctx.run_local(DELETED_STAGE, async move {
                let mut remote = remote;
                wait_deleted(&mut remote, &wait).await?;
                Ok(Value::Null)
            })
            .await
        }
        None => delete_local(ctx, &object).await,
    }
}

async fn on_remote_deleted(mut ctx: TaskContext, resource_kind: &'static str) -> Result<(), TaskError> {
    let result = match object_of(&ctx, resource_kind) {
        Ok(object) => delete_local(&mut ctx, &object).await,
        Err(e) => Err(e),
    };
    settle(&mut ctx, result, DELETE_FAILED, "delete").await
}

async fn on_remote_delete_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    fail_with_status(&mut ctx, DELETE_FAILED, "delete", payload_error(&payload)).await
}

async fn delete_local(ctx: &mut TaskContext, object: &Resource) -> Result<(), TaskError> {
    ctx.resources().delete(&object.kind, &object.id).await?;
    ctx.notify(actions::DELETE).await;
    ctx.action_log("delete", true, "").await;
    ctx.set_stage_complete(None).await
}

/// Issue the remote delete of `object`.
///
/// Returns the handle to wait on, or `None` when the object was never
/// created remotely or is already gone.
pub(crate) async fn issue_delete(
    env: &ComputeEnv,
    ctx: &TaskContext,
    object: &Resource,
) -> Result<Option<RemoteHandle>, TaskError> {
    let Some(external_id) = &object.external_id else {
        info!(task_id = %ctx.task_id(), object_id = %object.id, "No remote counterpart");
        return Ok(None);
    };
    let driver = env.drivers.for_resource(object)?;

    if let Err(e) = driver.get(&object.kind, external_id).await {
        if e.is_not_found() {
            info!(
                task_id = %ctx.task_id(),
                object_id = %object.id,
                external_id = %external_id,
                "Remote already gone"
            );
            return Ok(None);
        }
        return Err(e);
    }

    ctx.set_status(DELETING, None).await;
    match driver.delete(&object.kind, external_id).await {
        Err(e) if e.is_not_found() => return Ok(None),
        other => other?,
    }

    Ok(Some(RemoteHandle::new(driver, object.kind.clone(), external_id.clone())))
}
