// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Modelarts pool config change with a bounded wait.
//!
//! `OnInit` applies the config; the wait for the pool to settle runs as a
//! local job resumed at `OnConfigChanged`. A wait that runs out of budget
//! leaves the pool `TIMEOUT`.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use cloudtask_core::ports::actions;
use cloudtask_core::{CoreError, ErrorKind, Payload, ResourcePatch, TaskContext, TaskError, TaskKind};

use super::provider_create::await_available;
use super::{external_id_of, fail_with_status, object_of, payload_error, remote_state};
use crate::env::{ComputeEnv, bind};
use crate::status::{AVAILABLE, CHANGE_CONFIG, CHANGE_CONFIG_FAILED, TIMEOUT};

const POOL_KIND: &str = "modelarts_pool";
const CHANGED_STAGE: &str = "OnConfigChanged";

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    Ok(vec![
        TaskKind::builder("ModelartsPoolChangeConfigTask")
            .on("OnInit", bind(env, on_init))
            .on(CHANGED_STAGE, on_changed)
            .on("OnConfigChangedFailed", on_change_failed)
            .build()?,
    ])
}

async fn on_init(env: Arc<ComputeEnv>, mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
    match change_config(&env, &mut ctx).await {
        Ok(()) => Ok(()),
        Err(err) => fail_change(&mut ctx, err).await,
    }
}

async fn on_change_failed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    fail_change(&mut ctx, payload_error(&payload)).await
}

async fn fail_change(ctx: &mut TaskContext, err: TaskError) -> Result<(), TaskError> {
    let status = if err.kind == ErrorKind::Timeout {
        TIMEOUT
    } else {
        CHANGE_CONFIG_FAILED
    };
    fail_with_status(ctx, status, "change_config", err).await
}

async fn change_config(env: &ComputeEnv, ctx: &mut TaskContext) -> Result<(), TaskError> {
    let pool = object_of(ctx, POOL_KIND)?;
    let external_id = external_id_of(&pool)?;
    let driver = env.drivers.for_resource(&pool)?;
    let config: Map<String, Value> = ctx.param("config")?.unwrap_or_default();

    ctx.set_status(CHANGE_CONFIG, None).await;
    driver.change_config(POOL_KIND, &external_id, &config).await?;

    let wait = await_available(driver, POOL_KIND, external_id, &env.settings.change_config_wait);
    ctx.run_local(CHANGED_STAGE, wait).await
}

async fn on_changed(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
    match apply_change(&mut ctx, &payload).await {
        Ok(()) => Ok(()),
        Err(err) => fail_change(&mut ctx, err).await,
    }
}

async fn apply_change(ctx: &mut TaskContext, payload: &Payload) -> Result<(), TaskError> {
    let pool = object_of(ctx, POOL_KIND)?;
    if let Some(state) = remote_state(payload)? {
        ctx.resources()
            .update(POOL_KIND, &pool.id, ResourcePatch::attributes(state.attributes))
            .await?;
    }
    let config: Map<String, Value> = ctx.param("config")?.unwrap_or_default();

    ctx.set_status(AVAILABLE, None).await;
    ctx.action_log("change_config", true, "").await;
    ctx.notify(actions::UPDATE).await;
    ctx.set_stage_complete(Some(json!({"id": pool.id, "config": config})))
        .await
}
