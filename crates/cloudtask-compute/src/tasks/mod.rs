// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute task kinds, one module per family.
//!
//! | Module | Kinds |
//! |--------|-------|
//! | [`provider_create`] | `<Resource>CreateTask` over a provider driver |
//! | [`provider_delete`] | `<Resource>DeleteTask`, `CloudProviderDeleteTask` |
//! | [`nat_gateway`] | `NatGatewayCreateTask` with optional EIP |
//! | [`guest`] | Host-agent relays and guest delete / restart-network |
//! | [`baremetal`] | `BaremetalServerStopTask`, `BaremetalSyncAllGuestsStatusTask` |
//! | [`action_sync`] | Renew / auto-renew / change-config followed by a sync |
//! | [`syncstatus`] | Provider status syncs |
//! | [`cloud_account`] | `CloudAccountDeleteTask` fan-out |
//! | [`secgroup`] | `SecurityGroupSyncRulesTask` |
//! | [`modelarts`] | `ModelartsPoolChangeConfigTask` |

pub mod action_sync;
pub mod baremetal;
pub mod cloud_account;
pub mod guest;
pub mod modelarts;
pub mod nat_gateway;
pub mod provider_create;
pub mod provider_delete;
pub mod secgroup;
pub mod syncstatus;

use std::sync::Arc;

use tracing::{debug, warn};

use cloudtask_core::{CoreError, Payload, Resource, TaskContext, TaskError, TaskKind};

use crate::driver::RemoteResource;
use crate::env::ComputeEnv;

/// Every compute kind.
pub(crate) fn all_kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    let mut kinds = Vec::new();
    kinds.extend(provider_create::kinds(env)?);
    kinds.extend(provider_delete::kinds(env)?);
    kinds.extend(nat_gateway::kinds(env)?);
    kinds.extend(guest::kinds(env)?);
    kinds.extend(baremetal::kinds(env)?);
    kinds.extend(action_sync::kinds(env)?);
    kinds.extend(syncstatus::kinds(env)?);
    kinds.extend(cloud_account::kinds(env)?);
    kinds.extend(secgroup::kinds(env)?);
    kinds.extend(modelarts::kinds(env)?);
    Ok(kinds)
}

/// Record a failed operation on the bound objects and fail the task.
///
/// Sets `status` with the error as reason, writes `<action>_fail` to the
/// ops-log and a failed `action` entry to the action-log. A context that
/// already terminated (e.g. cancelled mid-stage) is left alone.
pub(crate) async fn fail_with_status(
    ctx: &mut TaskContext,
    status: &str,
    action: &str,
    err: TaskError,
) -> Result<(), TaskError> {
    if ctx.is_terminated() {
        debug!(task_id = %ctx.task_id(), error = %err, "Task already terminated");
        return Ok(());
    }
    warn!(
        task_id = %ctx.task_id(),
        kind = %ctx.kind(),
        status,
        error = %err,
        "Operation failed"
    );
    ctx.set_status(status, Some(&err.message)).await;
    ctx.ops_log(&format!("{}_fail", action), &err.message).await;
    ctx.action_log(action, false, &err.message).await;
    ctx.set_stage_failed(err).await
}

/// Resolve a stage body: errors become [`fail_with_status`].
pub(crate) async fn settle(
    ctx: &mut TaskContext,
    result: Result<(), TaskError>,
    status: &str,
    action: &str,
) -> Result<(), TaskError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => fail_with_status(ctx, status, action, err).await,
    }
}

/// Failure reason carried by a failure-polarity payload.
pub(crate) fn payload_error(payload: &Payload) -> TaskError {
    payload
        .error()
        .cloned()
        .unwrap_or_else(|| TaskError::internal("failure payload without reason"))
}

/// Remote state a local wait handed to its continuation stage.
pub(crate) fn remote_state(payload: &Payload) -> Result<Option<RemoteResource>, TaskError> {
    match payload.data() {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(data) => serde_json::from_value(data.clone())
            .map(Some)
            .map_err(|e| TaskError::internal(format!("malformed remote state: {}", e))),
    }
}

/// The bound object, checked to be of `kind`.
pub(crate) fn object_of(ctx: &TaskContext, kind: &str) -> Result<Resource, TaskError> {
    let object = ctx.object()?;
    if object.kind != kind {
        return Err(TaskError::validation(format!(
            "{} expects a {} object, got {} {}",
            ctx.kind(),
            kind,
            object.kind,
            object.id
        )));
    }
    Ok(object.clone())
}

/// External id of a resource that must already exist remotely.
pub(crate) fn external_id_of(resource: &Resource) -> Result<String, TaskError> {
    resource.external_id.clone().ok_or_else(|| {
        TaskError::validation(format!(
            "{} {} has not been created remotely",
            resource.kind, resource.id
        ))
    })
}
