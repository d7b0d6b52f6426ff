// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloudtask Compute - sandbox task server
//!
//! Runs the compute kinds over a SQLite task store with in-process resource,
//! quota, notification and lock ports, a scripted provider driver and a
//! scripted host agent. Serves submissions, queries and agent callbacks over
//! HTTP and posts results to remote parents.

use std::sync::Arc;

use tracing::{info, warn};

use cloudtask_compute::{ComputeEnv, ComputeSettings, Drivers, MockDriver, MockHostAgent, register_all};
use cloudtask_core::http::build_router;
use cloudtask_core::ports::http::{DEFAULT_NOTIFY_TIMEOUT, HttpParentNotifier};
use cloudtask_core::ports::memory::{InMemoryResources, LocalLocks, RecordingNotifier, RecordingQuota};
use cloudtask_core::{Config, SqliteTaskStore, TaskKindRegistry, TaskRuntimeBuilder};

/// Provider name served by the simulated driver.
const SANDBOX_PROVIDER: &str = "sandbox";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudtask_core=info,cloudtask_compute=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;
    let settings = ComputeSettings::from_env();

    info!(
        http_addr = %config.http_addr,
        max_concurrent_dispatches = config.max_concurrent_dispatches,
        max_concurrent_local_runs = config.max_concurrent_local_runs,
        pending_delete = settings.pending_delete,
        "Starting Cloudtask Compute"
    );

    // Open the task store
    let store = SqliteTaskStore::connect(&config.database_url).await?;
    info!("Task store ready");

    // Register kinds against the simulated provider and agent
    let env = Arc::new(ComputeEnv::new(
        Drivers::new().with(Arc::new(MockDriver::new(SANDBOX_PROVIDER))),
        Arc::new(MockHostAgent::new()),
        settings,
    ));
    let mut registry = TaskKindRegistry::new();
    register_all(&mut registry, env)?;
    info!(kinds = registry.len(), "Task kinds registered");

    // Start the runtime
    let runtime = TaskRuntimeBuilder::new()
        .with_config(&config)
        .with_store(Arc::new(store))
        .with_registry(registry)
        .with_resources(Arc::new(InMemoryResources::new()))
        .with_quota(Arc::new(RecordingQuota::new()))
        .with_notifier(Arc::new(RecordingNotifier::new()))
        .with_locks(Arc::new(LocalLocks::new()))
        .with_parent_notifier(Arc::new(HttpParentNotifier::new(DEFAULT_NOTIFY_TIMEOUT)?))
        .build()?
        .start()
        .await?;

    let recovered = runtime.recover_incomplete().await?;
    if recovered > 0 {
        warn!(recovered, "Failing tasks interrupted by the previous run");
    }

    // Serve HTTP until ctrl-c
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "Cloudtask Compute ready");

    axum::serve(listener, build_router(runtime.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Cloudtask Compute shut down");

    Ok(())
}
