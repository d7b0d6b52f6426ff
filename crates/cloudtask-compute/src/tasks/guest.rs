// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guest kinds driven through the host agent.
//!
//! Relays post to `<manager_url>/servers/<guest_id>/<op>` with the task
//! request header and park at a continuation stage. The agent answers either
//! inline, in which case the handler schedules the continuation itself, or
//! later through a callback on the notify URL.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use cloudtask_core::ports::actions;
use cloudtask_core::{
    CoreError, ObjectRef, Payload, ResourcePatch, TaskContext, TaskError, TaskKind,
    TaskSubmission, WaitOptions, wait_status,
};

use super::{fail_with_status, object_of, payload_error, settle};
use crate::agent::{AgentReply, Forward, HostAgent, PlaybookHandle, manager_url};
use crate::env::{ComputeEnv, bind};
use crate::status::{
    DELETE_FAILED, DELETING, PENDING_DELETE, READY, RESTART_NETWORK, RESTART_NETWORK_FAILED,
    STOP_FAILED, STOPPING, SYNCING_STATUS, UNKNOWN,
};

/// Resource kind of guests.
pub const GUEST_KIND: &str = "guest";
/// Resource kind of guest network ports.
pub const NETWORK_PORT_KIND: &str = "network_port";
/// Network port attribute naming its guest.
pub const GUEST_ID_ATTR: &str = "guest_id";
/// Network port attribute enforcing the source address.
pub const SRC_CHECK_ATTR: &str = "src_check";

const SSH_PORT: u16 = 22;
const RESTART_NETWORK_PLAYBOOK: &str = "restart_network";
const SRC_CHECK_BACKUP_PARAM: &str = "src_check_backup";
const PRIOR_STATUS_PARAM: &str = "prior_status";
const RESTARTED_STAGE: &str = "OnNetworkRestarted";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    Ok(vec![
        TaskKind::builder("GuestStopTask")
            .on("OnInit", bind(env, stop_on_init))
            .on("OnGuestStopComplete", |ctx, _payload| stop_complete(ctx))
            .on("OnGuestStopCompleteFailed", stop_failed)
            .build()?,
        TaskKind::builder("GuestSyncstatusTask")
            .on("OnInit", bind(env, sync_on_init))
            .on("OnGetStatusComplete", sync_complete)
            .on("OnGetStatusCompleteFailed", sync_failed)
            .build()?,
        TaskKind::builder("GuestDeleteTask")
            .on("OnInit", bind(env, delete_on_init))
            .on("OnGuestDeleteComplete", |ctx, _payload| delete_complete(ctx))
            .on("OnGuestDeleteCompleteFailed", delete_failed)
            .on("OnPendingDeleteSynced", |ctx, _payload| pending_delete_synced(ctx))
            .on("OnPendingDeleteSyncedFailed", delete_failed)
            .build()?,
        TaskKind::builder("GuestRestartNetworkTask")
            .on("OnInit", bind(env, restart_network_on_init))
            .on(RESTARTED_STAGE, |ctx, _payload| restart_network_complete(ctx))
            .on("OnNetworkRestartedFailed", restart_network_failed)
            .build()?,
    ])
}

/// Post `op` for the bound guest at the current stage.
///
/// An inline answer is fed back to the current stage once the handler
/// returns.
pub(crate) async fn relay(
    env: &ComputeEnv,
    ctx: &TaskContext,
    url: &str,
    body: Value,
) -> Result<(), TaskError> {
    let header = ctx.request_header();
    match env.agent.post(url, &header, &body).await? {
        AgentReply::Done(reply) => {
            ctx.schedule_run(Payload::Success(reply));
        }
        AgentReply::Accepted => {
            info!(task_id = %ctx.task_id(), stage = %ctx.stage(), url, "Waiting for agent callback");
        }
    }
    Ok(())
}

async fn guest_url(ctx: &TaskContext, op: &str) -> Result<String, TaskError> {
    let guest = object_of(ctx, GUEST_KIND)?;
    let base = manager_url(ctx.resources().as_ref(), &guest).await?;
    Ok(format!("{}/servers/{}/{}", base, guest.id, op))
}

// ============================================================================
// Stop
// ============================================================================

async fn stop_on_init(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = stop(&env, &mut ctx).await;
    settle(&mut ctx, result, STOP_FAILED, "stop").await
}

async fn stop(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let url = guest_url(ctx, "stop").await?;
    ctx.set_status(STOPPING, None).await;
    ctx.set_stage("OnGuestStopComplete", None).await?;
    let body = json!({"is_force": ctx.param_bool("is_force")});
    relay(env, ctx, &url, body).await
}

async fn stop_complete(mut ctx: TaskContext) -> Result<(), TaskError> {
    ctx.set_status(READY, None).await;
    ctx.action_log("stop", true, "").await;
    ctx.notify(actions::UPDATE).await;
    ctx.set_stage_complete(None).await
}

async fn stop_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    fail_with_status(&mut ctx, STOP_FAILED, "stop", payload_error(&payload)).await
}

// ============================================================================
// Sync status
// ============================================================================

async fn sync_on_init(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = sync(&env, &mut ctx).await;
    settle(&mut ctx, result, UNKNOWN, "sync_status").await
}

async fn sync(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let url = guest_url(ctx, "status").await?;
    ctx.set_status(SYNCING_STATUS, None).await;
    ctx.set_stage("OnGetStatusComplete", None).await?;
    relay(env, ctx, &url, json!({})).await
}

async fn sync_complete(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    let status = payload
        .data()
        .and_then(|data| data.get("status"))
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN)
        .to_string();
    ctx.set_status(&status, None).await;
    ctx.set_stage_complete(Some(json!({"status": status}))).await
}

async fn sync_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    fail_with_status(&mut ctx, UNKNOWN, "sync_status", payload_error(&payload)).await
}

// ============================================================================
// Delete
// ============================================================================

async fn delete_on_init(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = delete(&env, &mut ctx).await;
    settle(&mut ctx, result, DELETE_FAILED, "delete").await
}

async fn delete(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let guest = object_of(ctx, GUEST_KIND)?;
    let purge = ctx.param_bool("purge");

    if env.settings.pending_delete && !purge && !guest.pending_deleted {
        ctx.resources()
            .update(
                GUEST_KIND,
                &guest.id,
                ResourcePatch {
                    pending_deleted: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        ctx.set_status(PENDING_DELETE, None).await;
        ctx.ops_log("pending_delete", "").await;
        info!(task_id = %ctx.task_id(), guest_id = %guest.id, "Guest retained as pending delete");
        ctx.submit_child(
            "OnPendingDeleteSynced",
            TaskSubmission::new("GuestSyncstatusTask").object(ObjectRef::single(GUEST_KIND, &guest.id)),
        )
        .await?;
        return Ok(());
    }

    if purge {
        info!(task_id = %ctx.task_id(), guest_id = %guest.id, "Purge requested, agent left untouched");
        return delete_complete_inner(ctx).await;
    }

    let url = guest_url(ctx, "delete").await?;
    ctx.set_status(DELETING, None).await;
    ctx.set_stage("OnGuestDeleteComplete", None).await?;
    relay(env, ctx, &url, json!({})).await
}

async fn delete_complete_inner(ctx: &mut TaskContext) -> Result<(), TaskError> {
    let guest = object_of(ctx, GUEST_KIND)?;
    ctx.resources().delete(GUEST_KIND, &guest.id).await?;
    ctx.notify(actions::DELETE).await;
    ctx.action_log("delete", true, "").await;
    ctx.set_stage_complete(None).await
}

async fn delete_complete(mut ctx: TaskContext) -> Result<(), TaskError> {
    let result = delete_complete_inner(&mut ctx).await;
    settle(&mut ctx, result, DELETE_FAILED, "delete").await
}

async fn pending_delete_synced(mut ctx: TaskContext) -> Result<(), TaskError> {
    ctx.action_log("delete", true, "pending delete").await;
    ctx.set_stage_complete(None).await
}

async fn delete_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    fail_with_status(&mut ctx, DELETE_FAILED, "delete", payload_error(&payload)).await
}

// ============================================================================
// Restart network
// ============================================================================

async fn restart_network_on_init(
    env: Arc<ComputeEnv>,
    mut ctx: TaskContext,
    _payload: Payload,
) -> Result<(), TaskError> {
    let result = restart_network(&env, &mut ctx).await;
    if result.is_err() {
        restore_src_check(&ctx, &src_check_backup(&ctx)).await;
    }
    settle(&mut ctx, result, RESTART_NETWORK_FAILED, "restart_network").await
}

async fn restart_network(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let guest = object_of(ctx, GUEST_KIND)?;
    let manager = manager_url(ctx.resources().as_ref(), &guest).await?;

    let mut params = Map::new();
    params.insert(PRIOR_STATUS_PARAM.to_string(), Value::from(guest.status.clone()));
    ctx.save_params(params).await?;
    ctx.set_status(RESTART_NETWORK, None).await;

    disable_src_check(ctx, &guest.id).await?;

    let job = restart_over_forward(
        env.agent.clone(),
        manager,
        guest.id.clone(),
        env.settings.playbook_wait.clone(),
    );
    ctx.run_local(RESTARTED_STAGE, job).await
}

/// Local job: open an SSH forward, run the playbook and close the forward.
fn restart_over_forward(
    agent: Arc<dyn HostAgent>,
    manager: String,
    guest_id: String,
    wait: WaitOptions,
) -> impl Future<Output = Result<Value, TaskError>> + Send + 'static {
    async move {
        let forward = agent.open_forward(&manager, &guest_id, SSH_PORT).await?;
        let outcome = run_playbook(&agent, &forward, &wait).await;
        if let Err(e) = agent.close_forward(&manager, &forward).await {
            warn!(guest_id = %guest_id, forward_id = %forward.id, error = %e, "Failed to close forward");
        }
        outcome.map(|()| Value::Null)
    }
}

async fn run_playbook(
    agent: &Arc<dyn HostAgent>,
    forward: &Forward,
    wait: &WaitOptions,
) -> Result<(), TaskError> {
    let id = agent.run_playbook(forward, RESTART_NETWORK_PLAYBOOK).await?;
    let mut playbook = PlaybookHandle::new(agent.clone(), id);
    wait_status(&mut playbook, &["succeeded"], wait).await
}

async fn restart_network_complete(mut ctx: TaskContext) -> Result<(), TaskError> {
    restore_src_check(&ctx, &src_check_backup(&ctx)).await;
    let status = ctx
        .param_str(PRIOR_STATUS_PARAM)
        .unwrap_or(UNKNOWN)
        .to_string();
    ctx.set_status(&status, None).await;
    ctx.action_log("restart_network", true, "").await;
    ctx.set_stage_complete(None).await
}

async fn restart_network_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    restore_src_check(&ctx, &src_check_backup(&ctx)).await;
    fail_with_status(
        &mut ctx,
        RESTART_NETWORK_FAILED,
        "restart_network",
        payload_error(&payload),
    )
    .await
}

/// Turn source checking off on every port of the guest.
///
/// The previous flags are saved to the task params by port id before any
/// port changes, so every failure path can put them back.
async fn disable_src_check(ctx: &mut TaskContext, guest_id: &str) -> Result<(), TaskError> {
    let ports = ctx
        .resources()
        .list_by_attribute(NETWORK_PORT_KIND, GUEST_ID_ATTR, guest_id)
        .await?;

    let mut backup = Map::new();
    for port in &ports {
        let enabled = port
            .attributes
            .get(SRC_CHECK_ATTR)
            .and_then(Value::as_bool)
            .unwrap_or(true);
        backup.insert(port.id.clone(), Value::Bool(enabled));
    }
    let mut params = Map::new();
    params.insert(SRC_CHECK_BACKUP_PARAM.to_string(), Value::Object(backup));
    ctx.save_params(params).await?;

    for port in &ports {
        ctx.resources()
            .update(
                NETWORK_PORT_KIND,
                &port.id,
                ResourcePatch::default().with_attr(SRC_CHECK_ATTR, false),
            )
            .await?;
    }
    Ok(())
}

fn src_check_backup(ctx: &TaskContext) -> Map<String, Value> {
    ctx.params()
        .get(SRC_CHECK_BACKUP_PARAM)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

async fn restore_src_check(ctx: &TaskContext, backup: &Map<String, Value>) {
    for (port_id, enabled) in backup {
        if let Err(e) = ctx
            .resources()
            .update(
                NETWORK_PORT_KIND,
                port_id,
                ResourcePatch::default().with_attr(SRC_CHECK_ATTR, enabled.clone()),
            )
            .await
        {
            warn!(task_id = %ctx.task_id(), port_id = %port_id, error = %e, "Failed to restore source check");
        }
    }
}
