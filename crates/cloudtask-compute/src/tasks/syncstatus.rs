// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider status sync: copy remote status and attributes to the local record.

use std::sync::Arc;

use serde_json::json;

use cloudtask_core::{CoreError, Payload, ResourcePatch, TaskContext, TaskError, TaskKind};

use super::{external_id_of, object_of, settle};
use crate::env::{ComputeEnv, bind};
use crate::status::{SYNCING_STATUS, SYNC_FAILED};

/// Sync kinds and the resource kind each acts on.
pub const SYNC_KINDS: &[(&str, &str)] = &[
    ("ElasticcacheSyncstatusTask", "elasticcache"),
    ("DBInstanceSyncstatusTask", "dbinstance"),
    ("NatGatewaySyncstatusTask", "natgateway"),
];

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    SYNC_KINDS
        .iter()
        .map(|&(name, resource_kind)| {
            TaskKind::builder(name)
                .on(
                    "OnInit",
                    bind(env, move |env, ctx, payload| {
                        on_init(env, ctx, payload, resource_kind)
                    }),
                )
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
    let result = sync(&env, &mut ctx, resource_kind).await;
    settle(&mut ctx, result, SYNC_FAILED, "sync_status").await
}

async fn sync(env: &ComputeEnv, ctx: &mut TaskContext, resource_kind: &str) -> Result<(), TaskError> {
    let object = object_of(ctx, resource_kind)?;
    let external_id = external_id_of(&object)?;
    let driver = env.drivers.for_resource(&object)?;

    ctx.set_status(SYNCING_STATUS, None).await;
    let remote = driver.get(&object.kind, &external_id).await?;
    if !remote.attributes.is_empty() {
        ctx.resources()
            .update(
                &object.kind,
                &object.id,
                ResourcePatch::attributes(remote.attributes),
            )
            .await?;
    }
    ctx.set_status(&remote.status, None).await;
    ctx.set_stage_complete(Some(json!({"id": object.id, "status": remote.status})))
        .await
}
