// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Paired action + sync-status.
//!
//! The primary remote action runs in `OnInit`; a config change then waits
//! for the resource to settle in a local job resumed at `OnConfigChanged`.
//! The task waits on a sync-status child at `OnSyncstatusComplete` and
//! completes only once that child did.

use std::sync::Arc;

use serde_json::{Map, Value};

use cloudtask_core::ports::actions;
use cloudtask_core::{CoreError, ObjectRef, Payload, TaskContext, TaskError, TaskKind, TaskSubmission};

use super::provider_create::await_available;
use super::{external_id_of, fail_with_status, object_of, payload_error, settle};
use crate::env::{ComputeEnv, bind};
use crate::status::{
    CHANGE_CONFIG, CHANGE_CONFIG_FAILED, RENEW_FAILED, RENEWING, SET_AUTO_RENEW,
    SET_AUTO_RENEW_FAILED,
};

const CHANGED_STAGE: &str = "OnConfigChanged";
const CHANGED_FAILED_STAGE: &str = "OnConfigChangedFailed";
const SYNC_STAGE: &str = "OnSyncstatusComplete";
const SYNC_FAILED_STAGE: &str = "OnSyncstatusCompleteFailed";

/// Remote action run before the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Extend the subscription by the `duration` parameter.
    Renew,
    /// Switch auto-renew to the `auto_renew` parameter.
    SetAutoRenew,
    /// Apply the `config` parameter and wait for the resource to settle.
    ChangeConfig,
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Self::Renew => "renew",
            Self::SetAutoRenew => "set_auto_renew",
            Self::ChangeConfig => "change_config",
        }
    }

    fn in_progress(self) -> &'static str {
        match self {
            Self::Renew => RENEWING,
            Self::SetAutoRenew => SET_AUTO_RENEW,
            Self::ChangeConfig => CHANGE_CONFIG,
        }
    }

    fn failed(self) -> &'static str {
        match self {
            Self::Renew => RENEW_FAILED,
            Self::SetAutoRenew => SET_AUTO_RENEW_FAILED,
            Self::ChangeConfig => CHANGE_CONFIG_FAILED,
        }
    }
}

/// One action kind.
#[derive(Debug, Clone, Copy)]
pub struct ActionKind {
    /// Registered kind name.
    pub name: &'static str,
    /// Resource kind acted on.
    pub resource_kind: &'static str,
    /// Remote action.
    pub action: Action,
    /// Sync kind run afterwards.
    pub sync_kind: &'static str,
}

/// Registered action kinds.
pub const ACTION_KINDS: &[ActionKind] = &[
    ActionKind {
        name: "ElasticcacheRenewTask",
        resource_kind: "elasticcache",
        action: Action::Renew,
        sync_kind: "ElasticcacheSyncstatusTask",
    },
    ActionKind {
        name: "ElasticcacheSetAutoRenewTask",
        resource_kind: "elasticcache",
        action: Action::SetAutoRenew,
        sync_kind: "ElasticcacheSyncstatusTask",
    },
    ActionKind {
        name: "DBInstanceChangeConfigTask",
        resource_kind: "dbinstance",
        action: Action::ChangeConfig,
        sync_kind: "DBInstanceSyncstatusTask",
    },
    ActionKind {
        name: "NatSetAutoRenewTask",
        resource_kind: "natgateway",
        action: Action::SetAutoRenew,
        sync_kind: "NatGatewaySyncstatusTask",
    },
];

pub(crate) fn kinds(env: &Arc<ComputeEnv>) -> Result<Vec<TaskKind>, CoreError> {
    ACTION_KINDS
        .iter()
        .map(|&action_kind| {
            TaskKind::builder(action_kind.name)
                .on(
                    "OnInit",
                    bind(env, move |env, ctx, payload| on_init(env, ctx, payload, action_kind)),
                )
                .on(CHANGED_STAGE, move |ctx, payload| on_changed(ctx, payload, action_kind))
                .on(CHANGED_FAILED_STAGE, move |ctx, payload| {
                    on_action_failed(ctx, payload, action_kind)
                })
                .on(SYNC_STAGE, move |ctx, payload| on_synced(ctx, payload, action_kind))
                .on(SYNC_FAILED_STAGE, move |ctx, payload| {
                    on_action_failed(ctx, payload, action_kind)
                })
                .build()
        })
        .collect()
}

async fn on_init(
    env: Arc<ComputeEnv>,
    mut ctx: TaskContext,
    _payload: Payload,
    action_kind: ActionKind,
) -> Result<(), TaskError> {
    let result = run(&env, &mut ctx, action_kind).await;
    settle(&mut ctx, result, action_kind.action.failed(), action_kind.action.name()).await
}

async fn run(env: &ComputeEnv, ctx: &mut TaskContext, action_kind: ActionKind) -> Result<(), TaskError> {
    let object = object_of(ctx, action_kind.resource_kind)?;
    let external_id = external_id_of(&object)?;
    let driver = env.drivers.for_resource(&object)?;

    ctx.set_status(action_kind.action.in_progress(), None).await;
    match action_kind.action {
        Action::Renew => {
            let duration: String = ctx
                .param("duration")?
                .ok_or_else(|| TaskError::validation("renew requires a duration"))?;
            driver.renew(&object.kind, &external_id, &duration).await?;
        }
        Action::SetAutoRenew => {
            let enabled = ctx.param_bool("auto_renew");
            driver
                .set_auto_renew(&object.kind, &external_id, enabled)
                .await?;
        }
        Action::ChangeConfig => {
            let config: Map<String, Value> = ctx
                .param("config")?
                .ok_or_else(|| TaskError::validation("change_config requires a config"))?;
            driver
                .change_config(&object.kind, &external_id, &config)
                .await?;
            let wait = await_available(
                driver,
                &object.kind,
                external_id,
                &env.settings.change_config_wait,
            );
            return ctx.run_local(CHANGED_STAGE, wait).await;
        }
    }

    start_sync(ctx, action_kind).await
}

async fn on_changed(mut ctx: TaskContext, _payload: Payload, action_kind: ActionKind) -> Result<(), TaskError> {
    let result = start_sync(&mut ctx, action_kind).await;
    settle(&mut ctx, result, action_kind.action.failed(), action_kind.action.name()).await
}

async fn start_sync(ctx: &mut TaskContext, action_kind: ActionKind) -> Result<(), TaskError> {
    let object = object_of(ctx, action_kind.resource_kind)?;
    ctx.submit_child(
        SYNC_STAGE,
        TaskSubmission::new(action_kind.sync_kind).object(ObjectRef::single(&object.kind, &object.id)),
    )
    .await?;
    Ok(())
}

async fn on_synced(mut ctx: TaskContext, payload: Payload, action_kind: ActionKind) -> Result<(), TaskError> {
    ctx.action_log(action_kind.action.name(), true, "").await;
    ctx.notify(actions::UPDATE).await;
    ctx.set_stage_complete(payload.data().cloned()).await
}

async fn on_action_failed(
    mut ctx: TaskContext,
    payload: Payload,
    action_kind: ActionKind,
) -> Result<(), TaskError> {
    fail_with_status(
        &mut ctx,
        action_kind.action.failed(),
        action_kind.action.name(),
        payload_error(&payload),
    )
    .await
}
