// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud account delete: one `CloudProviderDeleteTask` per provider, then
//! the account itself.

use std::sync::Arc;

use tracing::info;

use cloudtask_core::ports::actions;
use cloudtask_core::{
    CoreError, ObjectRef, Payload, TaskContext, TaskError, TaskKind, TaskSubmission,
};

use super::{fail_with_status, object_of, payload_error, settle};
use crate::env::{ComputeEnv, bind};
use crate::status::{DELETE_FAILED, DELETING};

const ACCOUNT_KIND: &str = "cloudaccount";
const PROVIDER_KIND: &str = "cloudprovider";
/// Provider attribute naming its account.
pub const ACCOUNT_ID_ATTR: &str = "cloudaccount_id";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    Ok(vec![
        TaskKind::builder("CloudAccountDeleteTask")
            .on("OnInit", bind(env, on_init))
            .on("OnProvidersDeleted", |ctx, _payload| on_providers_deleted(ctx))
            .on("OnProvidersDeletedFailed", on_providers_failed)
            .build()?,
    ])
}

async fn on_init(_env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    let result = start(&mut ctx).await;
    settle(&mut ctx, result, DELETE_FAILED, "delete").await
}

async fn start(ctx: &mut TaskContext) -> Result<(), TaskError> {
    let account = object_of(ctx, ACCOUNT_KIND)?;
    let providers = ctx
        .resources()
        .list_by_attribute(PROVIDER_KIND, ACCOUNT_ID_ATTR, &account.id)
        .await?;

    ctx.set_status(DELETING, None).await;
    if providers.is_empty() {
        info!(task_id = %ctx.task_id(), account_id = %account.id, "Account has no providers");
        return finish(ctx).await;
    }

    let purge = ctx.param_bool("purge");
    let children = providers
        .iter()
        .map(|provider| {
            TaskSubmission::new("CloudProviderDeleteTask")
                .object(ObjectRef::single(PROVIDER_KIND, &provider.id).named(&provider.name))
                .param("purge", purge)
        })
        .collect();
    ctx.submit_children("OnProvidersDeleted", children).await?;
    Ok(())
}

async fn finish(ctx: &mut TaskContext) -> Result<(), TaskError> {
    let account = object_of(ctx, ACCOUNT_KIND)?;
    ctx.resources().delete(ACCOUNT_KIND, &account.id).await?;
    ctx.notify(actions::DELETE).await;
    ctx.action_log("delete", true, "").await;
    ctx.set_stage_complete(None).await
}

async fn on_providers_deleted(mut ctx: TaskContext) -> Result<(), TaskError> {
    let result = finish(&mut ctx).await;
    settle(&mut ctx, result, DELETE_FAILED, "delete").await
}

async fn on_providers_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    fail_with_status(&mut ctx, DELETE_FAILED, "delete", payload_error(&payload)).await
}
