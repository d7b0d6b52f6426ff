// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Baremetal host kinds.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use cloudtask_core::ports::actions;
use cloudtask_core::{
    CoreError, ObjectRef, Payload, TaskContext, TaskError, TaskKind, TaskSubmission,
};

use super::guest::{GUEST_KIND, relay};
use super::{fail_with_status, object_of, payload_error, settle};
use crate::agent::{HOST_ID_ATTR, HOST_KIND, manager_url};
use crate::env::{ComputeEnv, bind};
use crate::status::{READY, STOP_FAILED, STOPPING, UNKNOWN};

/// Guest attribute naming the hypervisor.
pub const HYPERVISOR_ATTR: &str = "hypervisor";
/// Hypervisor of guests that are whole baremetal servers.
pub const HYPERVISOR_BAREMETAL: &str = "baremetal";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    Ok(vec![
        TaskKind::builder("BaremetalSyncAllGuestsStatusTask")
            .on("OnInit", |ctx, _payload| sync_all_on_init(ctx))
            .on("OnGuestsSynced", |ctx, payload| guests_synced(ctx, payload))
            .build()?,
        TaskKind::builder("BaremetalServerStopTask")
            .on("OnInit", bind(env, stop_on_init))
            .on("OnStopServerComplete", |ctx, _payload| stop_complete(ctx))
            .on("OnStopServerCompleteFailed", stop_failed)
            .build()?,
    ])
}

// ============================================================================
// Sync all guests
// ============================================================================

async fn sync_all_on_init(mut ctx: TaskContext) -> Result<(), TaskError> {
    let host = object_of(&ctx, HOST_KIND)?;
    let guests: Vec<_> = ctx
        .resources()
        .list_by_attribute(GUEST_KIND, HOST_ID_ATTR, &host.id)
        .await?
        .into_iter()
        .filter(|guest| {
            guest.status == UNKNOWN
                && guest
                    .attr_str(HYPERVISOR_ATTR)
                    .is_some_and(|h| h.eq_ignore_ascii_case(HYPERVISOR_BAREMETAL))
        })
        .collect();

    if guests.is_empty() {
        info!(task_id = %ctx.task_id(), host_id = %host.id, "No guests to sync");
        return ctx.set_stage_complete(Some(json!({"total": 0}))).await;
    }

    info!(task_id = %ctx.task_id(), host_id = %host.id, guests = guests.len(), "Syncing guest status");
    let children = guests
        .iter()
        .map(|guest| {
            TaskSubmission::new("GuestSyncstatusTask")
                .object(ObjectRef::single(GUEST_KIND, &guest.id).named(&guest.name))
        })
        .collect();
    ctx.submit_children("OnGuestsSynced", children).await?;
    Ok(())
}

// A failed child falls through to the default rule and fails this task.
async fn guests_synced(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    ctx.set_stage_complete(payload.data().cloned()).await
}

// ============================================================================
// Server stop
// ============================================================================

async fn stop_on_init(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = stop(&env, &mut ctx).await;
    settle(&mut ctx, result, STOP_FAILED, "stop").await
}

/// Stops the server only when its host is still registered.
async fn stop(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let server = object_of(ctx, GUEST_KIND)?;
    let host_id = server
        .attr_str(HOST_ID_ATTR)
        .ok_or_else(|| TaskError::validation(format!("server {} has no host", server.id)))?;
    let host = ctx
        .resources()
        .fetch(HOST_KIND, host_id)
        .await?
        .ok_or_else(|| TaskError::not_found(format!("fail to find {} object {}", HOST_KIND, host_id)))?;

    let base = manager_url(ctx.resources().as_ref(), &host).await?;
    let url = format!("{}/baremetals/{}/servers/{}/stop", base, host.id, server.id);

    ctx.set_status(STOPPING, None).await;
    ctx.set_stage("OnStopServerComplete", None).await?;
    relay(env, ctx, &url, json!({})).await
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
