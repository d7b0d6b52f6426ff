// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloudtask Core - Multi-Stage Asynchronous Task Engine
//!
//! This crate runs long-lived cloud operations (create a NAT gateway, delete a
//! guest, change a database flavour) as persisted state machines. A task
//! advances through named stages; each stage handler performs a bounded piece
//! of work, then either terminates the task or moves it to a new stage and
//! returns. The next stage runs when a remote worker posts a callback, when
//! the handler itself schedules a continuation, or when every child task of
//! the stage has terminated.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │          Submitters / remote workers (HTTP callbacks, CLI, tests)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ submit / callback / cancel
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             TaskRuntime                                  │
//! │      worker pool (semaphore)  ·  per-task lock  ·  deferred dispatch     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                         │                          │
//!           ▼                         ▼                          ▼
//! ┌───────────────────┐   ┌──────────────────────┐   ┌────────────────────┐
//! │  TaskKindRegistry │   │     TaskContext      │   │     TaskStore      │
//! │  kind → handlers  │   │ (handed to handlers) │   │  records, subtasks │
//! └───────────────────┘   └──────────────────────┘   │  SQLite / memory   │
//!                                     │              └────────────────────┘
//!                                     ▼
//!             ┌────────────────────────────────────────────────┐
//!             │  Ports: Resource · Quota · Notification · Lock │
//!             │         · ParentNotify (remote parents)        │
//!             └────────────────────────────────────────────────┘
//! ```
//!
//! # Task Lifecycle
//!
//! ```text
//!   init ──OnInit──► OnStageA ──callback──► OnStageB ──children done──► complete
//!     │                 │                      │
//!     └─────────────────┴──────── error ───────┴──────────────────────► failed
//! ```
//!
//! | Stage | Description |
//! |-------|-------------|
//! | `init` | Created, first dispatch runs the `OnInit` handler |
//! | `On...` | Waiting for a callback, a continuation or its children |
//! | `complete` | Terminal success; result holds the handler's data |
//! | `failed` | Terminal failure; result holds the classified reason |
//!
//! A failure payload for stage `OnX` is routed to the handler `OnXFailed`.
//! A kind without a handler for the incoming payload completes on success
//! and fails on failure, carrying the reason through unchanged.
//!
//! # Guarantees
//!
//! | Guarantee | Mechanism |
//! |-----------|-----------|
//! | One handler at a time per task | per-task lock around each dispatch |
//! | Parent signalled once per stage | subtask rows recorded once, in one write |
//! | Terminal stages are final | conditional writes in [`TaskStore::terminate`] |
//! | Stale callbacks dropped | expected-stage check before dispatch |
//! | Quota released once | release bound to the terminating write |
//! | Long waits never hold a dispatch permit | [`TaskContext::run_local`] jobs |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`]. The `http` feature adds an axum router
//! over the runtime (see `http::build_router`).

#![deny(missing_docs)]

pub mod cleanup_worker;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod persistence;
pub mod ports;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod wait;

pub use cleanup_worker::{TaskCleanupWorker, TaskCleanupWorkerConfig};
pub use config::{Config, ConfigError};
pub use context::TaskContext;
pub use dispatcher::DispatchOutcome;
pub use error::{CoreError, ErrorKind, Result, TaskError};
pub use persistence::{
    MemoryTaskStore, SqliteTaskStore, SubtaskOutcome, SubtaskStatus, SubtaskSummary, TaskFilter,
    TaskStore,
};
pub use ports::{
    LockGuard, LockPort, NotificationPort, NotifyEvent, ParentNotifyPort, QuotaPort, Resource,
    ResourcePatch, ResourcePort,
};
pub use record::{ObjectRef, Outcome, Payload, Polarity, TaskRecord, UserCred};
pub use registry::{HandlerFuture, StageHandler, TaskKind, TaskKindBuilder, TaskKindRegistry};
pub use runtime::{TaskRuntime, TaskRuntimeBuilder, TaskRuntimeConfig, TaskSubmission};
pub use wait::{RemoteStatus, WaitOptions, wait_deleted, wait_status};
