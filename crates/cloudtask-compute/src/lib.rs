// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloudtask Compute - compute task kinds
//!
//! The concrete kinds run on top of [`cloudtask_core`]. They talk to clouds
//! through a [`driver::CloudDriver`] chosen by the `provider` attribute of the
//! resource, and to hypervisor hosts through a [`agent::HostAgent`].
//!
//! | Family | Shape |
//! |--------|-------|
//! | Provider create | create remotely, wait for `AVAILABLE`, sync back |
//! | Provider delete | tolerate a missing remote, wait for disappearance |
//! | NAT gateway | create, then allocate or re-use an EIP, then sync |
//! | Host-agent relay | post with the task header, resume on callback |
//! | Action + sync | renew / auto-renew / change-config, then a sync child |
//! | Fan-out | one child per provider or guest, aggregate in the parent |
//! | Retain-on-soft-delete | mark guests pending-deleted instead of removing |
//! | Restart network | forward + playbook with source-check toggling |
//! | Rule-set sync | copy remote security rules to the local record |
//!
//! Bounded remote waits never run inside a stage handler: the handler hands
//! them to [`cloudtask_core::TaskContext::run_local`] and the kind resumes at
//! a named stage such as `OnRemoteReady` or `OnConfigChanged`.
//!
//! # Usage
//!
//! ```ignore
//! let env = Arc::new(ComputeEnv::new(drivers, agent, ComputeSettings::from_env()));
//! let mut registry = TaskKindRegistry::new();
//! register_all(&mut registry, env)?;
//! let runtime = TaskRuntimeBuilder::new().with_registry(registry) /* ports */ .build()?.start().await?;
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod driver;
pub mod env;
pub mod mock;
pub mod status;
pub mod tasks;

pub use agent::{AgentReply, Forward, HostAgent};
pub use driver::{CloudDriver, CreateOptions, Drivers, RemoteHandle, RemoteResource};
pub use env::{ComputeEnv, ComputeSettings, register_all};
pub use mock::{MockDriver, MockHostAgent};
