// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Security group rule-set sync.

use std::sync::Arc;

use serde_json::{Value, json};

use cloudtask_core::{CoreError, Payload, ResourcePatch, TaskContext, TaskError, TaskKind};

use super::{external_id_of, object_of, settle};
use crate::env::{ComputeEnv, bind};
use crate::status::{AVAILABLE, SYNC_FAILED, SYNC_RULES};

const SECGROUP_KIND: &str = "security_group";
/// Attribute holding the synced rules.
pub const RULES_ATTR: &str = "rules";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    Ok(vec![
        TaskKind::builder("SecurityGroupSyncRulesTask")
            .on("OnInit", bind(env, on_init))
            .build()?,
    ])
}

async fn on_init(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = sync_rules(&env, &mut ctx).await;
    settle(&mut ctx, result, SYNC_FAILED, "sync_rules").await
}

async fn sync_rules(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let group = object_of(ctx, SECGROUP_KIND)?;
    let external_id = external_id_of(&group)?;
    let driver = env.drivers.for_resource(&group)?;

    ctx.set_status(SYNC_RULES, None).await;
    let rules = driver.list_security_rules(&external_id).await?;
    let count = rules.len();
    ctx.resources()
        .update(
            SECGROUP_KIND,
            &group.id,
            ResourcePatch::default().with_attr(RULES_ATTR, Value::Array(rules)),
        )
        .await?;

    ctx.set_status(AVAILABLE, None).await;
    ctx.action_log("sync_rules", true, &format!("{} rules", count))
        .await;
    ctx.set_stage_complete(Some(json!({"id": group.id, "rules": count})))
        .await
}
