// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! NAT gateway create with an optional elastic ip.
//!
//! Stages:
//!
//! 1. `OnInit` creates the gateway remotely; the wait for it runs as a
//!    local job.
//! 2. `OnNatReady` syncs the gateway back. An `eip_id` parameter re-uses
//!    that EIP right away; an `eip_bandwidth` parameter creates a new EIP
//!    through a child `ElasticipCreateTask`.
//! 3. `OnEipReady` associates the freshly created EIP.
//! 4. `OnSyncstatusComplete` runs after the `NatGatewaySyncstatusTask` child
//!    and emits the create event.
//!
//! The EIP reservation travels in the `eip_pending_usage` parameter. One
//! EIP of it is split off to the EIP child when one is created and the rest
//! is cancelled; re-using an existing EIP cancels all of it. The parameter
//! is cleared once handed off or cancelled, and any failure cancels what is
//! still held.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use cloudtask_core::ports::actions;
use cloudtask_core::{
    CoreError, ObjectRef, Payload, Resource, ResourcePatch, TaskContext, TaskError, TaskKind,
    TaskSubmission,
};

use super::provider_create::{apply_remote_state, await_available, issue_create};
use super::{external_id_of, fail_with_status, object_of, payload_error, remote_state};
use crate::driver::PROVIDER_ATTR;
use crate::env::{ComputeEnv, bind};
use crate::status::{CREATE_FAILED, CREATING};

const NAT_KIND: &str = "natgateway";
const EIP_KIND: &str = "eip";
/// EIP attribute naming the gateway it was created for.
pub const NAT_ID_ATTR: &str = "natgateway_id";
/// Parameter carrying the EIP quota reservation.
pub const EIP_USAGE_PARAM: &str = "eip_pending_usage";
const EIP_RESOURCE_PARAM: &str = "eip_resource_id";
const NAT_READY_STAGE: &str = "OnNatReady";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    Ok(vec![
        TaskKind::builder("NatGatewayCreateTask")
            .on("OnInit", bind(env, on_init))
            .on(NAT_READY_STAGE, bind(env, on_nat_ready))
            .on("OnNatReadyFailed", on_failed)
            .on("OnEipReady", bind(env, on_eip_ready))
            .on("OnEipReadyFailed", on_failed)
            .on("OnSyncstatusComplete", |ctx, _payload| on_synced(ctx))
            .on("OnSyncstatusCompleteFailed", on_failed)
            .build()?,
    ])
}

async fn on_init(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = start_create(&env, &mut ctx).await;
    settle_create(&mut ctx, result).await
}

async fn start_create(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let nat = object_of(ctx, NAT_KIND)?;
    let (driver, external_id) = issue_create(env, ctx, &nat).await?;
    let wait = await_available(driver, NAT_KIND, external_id, &env.settings.create_wait);
    ctx.run_local(NAT_READY_STAGE, wait).await
}

async fn on_nat_ready(env: Arc<ComputeEnv>, mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    let result = attach_eip(&env, &mut ctx, &payload).await;
    settle_create(&mut ctx, result).await
}

async fn attach_eip(env: &ComputeEnv, ctx: &mut TaskContext, payload: &Payload) -> Result<(), TaskError> {
    let nat = object_of(ctx, NAT_KIND)?;
    let nat_external_id = apply_remote_state(env, ctx, &nat, remote_state(payload)?).await?;

    if let Some(eip_id) = ctx.param_str("eip_id").map(str::to_string) {
        associate(env, ctx, &nat, &nat_external_id, &eip_id).await?;
        cancel_eip_usage(ctx).await?;
        return start_sync(ctx, &nat).await;
    }

    if let Some(bandwidth) = ctx.param::<u64>("eip_bandwidth")? {
        let eip_id = allocate_eip(ctx, &nat, bandwidth).await?;
        let child_usage = match eip_usage(ctx) {
            Some(usage) => {
                let portion = json!({EIP_KIND: 1});
                let remaining = ctx.quota().split(&usage, &portion)?;
                if has_reservation(&remaining) {
                    ctx.quota().cancel(ctx.user_cred(), &remaining).await?;
                }
                Some(portion)
            }
            None => None,
        };

        let mut params = Map::new();
        params.insert(EIP_RESOURCE_PARAM.to_string(), Value::from(eip_id.clone()));
        params.insert(EIP_USAGE_PARAM.to_string(), Value::Null);
        ctx.set_stage("OnEipReady", Some(params)).await?;

        let mut child = TaskSubmission::new("ElasticipCreateTask")
            .object(ObjectRef::single(EIP_KIND, &eip_id))
            .param("bandwidth", bandwidth);
        if let Some(usage) = child_usage {
            child = child.pending_usage(usage);
        }
        ctx.submit_child("OnEipReady", child).await?;
        return Ok(());
    }

    start_sync(ctx, &nat).await
}

/// Local EIP record for the gateway, created once under the EIP class lock.
async fn allocate_eip(ctx: &TaskContext, nat: &Resource, bandwidth: u64) -> Result<String, TaskError> {
    let _guard = ctx.locks().lock_class(EIP_KIND).await;

    let existing = ctx
        .resources()
        .list_by_attribute(EIP_KIND, NAT_ID_ATTR, &nat.id)
        .await?;
    if let Some(eip) = existing.first() {
        info!(task_id = %ctx.task_id(), eip_id = %eip.id, "Re-using EIP allocated earlier");
        return Ok(eip.id.clone());
    }

    let mut eip = Resource::new(
        EIP_KIND,
        uuid::Uuid::new_v4().to_string(),
        format!("{}-eip", nat.name),
        CREATING,
    )
    .with_attr("bandwidth", bandwidth)
    .with_attr(NAT_ID_ATTR, nat.id.clone());
    if let Some(provider) = nat.attr_str(PROVIDER_ATTR) {
        eip = eip.with_attr(PROVIDER_ATTR, provider);
    }
    let eip = ctx.resources().create(eip).await?;
    info!(task_id = %ctx.task_id(), eip_id = %eip.id, bandwidth, "Allocated EIP");
    Ok(eip.id)
}

async fn on_eip_ready(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = attach_created_eip(&env, &mut ctx).await;
    settle_create(&mut ctx, result).await
}

async fn attach_created_eip(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let nat = object_of(ctx, NAT_KIND)?;
    let nat_external_id = external_id_of(&nat)?;
    let eip_id = ctx
        .param_str(EIP_RESOURCE_PARAM)
        .map(str::to_string)
        .ok_or_else(|| TaskError::internal("EIP id lost between stages"))?;
    associate(env, ctx, &nat, &nat_external_id, &eip_id).await?;
    start_sync(ctx, &nat).await
}

async fn associate(
    env: &ComputeEnv,
    ctx: &TaskContext,
    nat: &Resource,
    nat_external_id: &str,
    eip_id: &str,
) -> Result<(), TaskError> {
    let eip = ctx
        .resources()
        .fetch(EIP_KIND, eip_id)
        .await?
        .ok_or_else(|| TaskError::not_found(format!("fail to find {} object {}", EIP_KIND, eip_id)))?;
    let eip_external_id = external_id_of(&eip)?;

    let driver = env.drivers.for_resource(nat)?;
    driver
        .associate_eip(&eip_external_id, NAT_KIND, nat_external_id)
        .await?;
    ctx.resources()
        .update(
            EIP_KIND,
            &eip.id,
            ResourcePatch::default()
                .with_attr("associate_id", nat.id.clone())
                .with_attr("associate_type", NAT_KIND),
        )
        .await?;
    info!(task_id = %ctx.task_id(), eip_id = %eip.id, nat_id = %nat.id, "EIP associated");
    Ok(())
}

fn eip_usage(ctx: &TaskContext) -> Option<Value> {
    ctx.params()
        .get(EIP_USAGE_PARAM)
        .filter(|usage| !usage.is_null())
        .cloned()
}

fn has_reservation(usage: &Value) -> bool {
    usage
        .as_object()
        .is_some_and(|fields| fields.values().any(|v| v.as_i64().is_none_or(|n| n != 0)))
}

/// Cancel the EIP reservation still held by this task and clear it.
async fn cancel_eip_usage(ctx: &mut TaskContext) -> Result<(), TaskError> {
    let Some(usage) = eip_usage(ctx) else {
        return Ok(());
    };
    ctx.quota().cancel(ctx.user_cred(), &usage).await?;
    let mut params = Map::new();
    params.insert(EIP_USAGE_PARAM.to_string(), Value::Null);
    ctx.save_params(params).await
}

/// Cancel the held EIP reservation, logging instead of failing.
async fn release_on_failure(ctx: &mut TaskContext) {
    if let Err(e) = cancel_eip_usage(ctx).await {
        warn!(task_id = %ctx.task_id(), error = %e, "Failed to cancel EIP reservation");
    }
}

async fn settle_create(ctx: &mut TaskContext, result: Result<(), TaskError>) -> Result<(), TaskError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            release_on_failure(ctx).await;
            fail_with_status(ctx, CREATE_FAILED, "create", err).await
        }
    }
}

async fn start_sync(ctx: &mut TaskContext, nat: &Resource) -> Result<(), TaskError> {
    ctx.submit_child(
        "OnSyncstatusComplete",
        TaskSubmission::new("NatGatewaySyncstatusTask").object(ObjectRef::single(NAT_KIND, &nat.id)),
    )
    .await?;
    Ok(())
}

async fn on_synced(mut ctx: TaskContext) -> Result<(), TaskError> {
    ctx.notify(actions::CREATE).await;
    ctx.action_log("create", true, "").await;
    ctx.set_stage_complete(None).await
}

async fn on_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    release_on_failure(&mut ctx).await;
    fail_with_status(&mut ctx, CREATE_FAILED, "create", payload_error(&payload)).await
}
