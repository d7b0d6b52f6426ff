// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource status values written by compute kinds.
//!
//! Statuses live on the resource, not on the task. A typical walk is
//! `CREATING → AVAILABLE → <OP> → <OP>_FAILED → SYNCING_STATUS → AVAILABLE`.

pub use cloudtask_core::ports::status::{AVAILABLE, UNKNOWN};

/// Remote create in progress.
pub const CREATING: &str = "CREATING";
/// Remote create failed.
pub const CREATE_FAILED: &str = "CREATE_FAILED";
/// Remote delete in progress.
pub const DELETING: &str = "DELETING";
/// Remote or local delete failed.
pub const DELETE_FAILED: &str = "DELETE_FAILED";
/// Status being refreshed from the provider or host agent.
pub const SYNCING_STATUS: &str = "SYNCING_STATUS";
/// Status refresh failed.
pub const SYNC_FAILED: &str = "SYNC_FAILED";
/// A bounded wait ran out.
pub const TIMEOUT: &str = "TIMEOUT";
/// Flavour or size change in progress.
pub const CHANGE_CONFIG: &str = "CHANGE_CONFIG";
/// Flavour or size change failed.
pub const CHANGE_CONFIG_FAILED: &str = "CHANGE_CONFIG_FAILED";
/// Renewal in progress.
pub const RENEWING: &str = "RENEWING";
/// Renewal failed.
pub const RENEW_FAILED: &str = "RENEW_FAILED";
/// Auto-renew switch in progress.
pub const SET_AUTO_RENEW: &str = "SET_AUTO_RENEW";
/// Auto-renew switch failed.
pub const SET_AUTO_RENEW_FAILED: &str = "SET_AUTO_RENEW_FAILED";
/// Marked for deletion but retained.
pub const PENDING_DELETE: &str = "PENDING_DELETE";
/// Guest stop in progress.
pub const STOPPING: &str = "STOPPING";
/// Guest stop failed.
pub const STOP_FAILED: &str = "STOP_FAILED";
/// Guest is stopped and ready to start.
pub const READY: &str = "READY";
/// Security rules being synced.
pub const SYNC_RULES: &str = "SYNC_RULES";
/// Guest network restart in progress.
pub const RESTART_NETWORK: &str = "RESTART_NETWORK";
/// Guest network restart failed.
pub const RESTART_NETWORK_FAILED: &str = "RESTART_NETWORK_FAILED";
