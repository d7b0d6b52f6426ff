// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;

use crate::cleanup_worker::TaskCleanupWorkerConfig;
use crate::runtime::{DEFAULT_MAX_CONCURRENT_DISPATCHES, DEFAULT_MAX_CONCURRENT_LOCAL_RUNS};

/// Task engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL of the task record store
    pub database_url: String,
    /// HTTP address for submissions and callbacks
    pub http_addr: SocketAddr,
    /// Maximum concurrently running stage dispatches
    pub max_concurrent_dispatches: usize,
    /// Maximum concurrently running local jobs (long waits off the dispatch pool)
    pub max_concurrent_local_runs: usize,
    /// Public base URL advertised to remote workers
    pub service_url: Option<String>,
    /// Archive worker settings
    pub cleanup: TaskCleanupWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CLOUDTASK_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CLOUDTASK_HTTP_PORT`: HTTP server port (default: 8080)
    /// - `CLOUDTASK_MAX_CONCURRENT_DISPATCHES`: Max concurrent dispatches (default: 32)
    /// - `CLOUDTASK_MAX_CONCURRENT_LOCAL_RUNS`: Max concurrent local jobs (default: 256)
    /// - `CLOUDTASK_SERVICE_URL`: Base URL for task callbacks (default: unset)
    ///
    /// Archive settings are read by [`TaskCleanupWorkerConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CLOUDTASK_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CLOUDTASK_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("CLOUDTASK_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CLOUDTASK_HTTP_PORT", "must be a valid port number"))?;

        let max_concurrent_dispatches: usize = std::env::var("CLOUDTASK_MAX_CONCURRENT_DISPATCHES")
            .unwrap_or_else(|_| DEFAULT_MAX_CONCURRENT_DISPATCHES.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "CLOUDTASK_MAX_CONCURRENT_DISPATCHES",
                "must be a positive integer",
            ))?;

        let max_concurrent_local_runs: usize = std::env::var("CLOUDTASK_MAX_CONCURRENT_LOCAL_RUNS")
            .unwrap_or_else(|_| DEFAULT_MAX_CONCURRENT_LOCAL_RUNS.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "CLOUDTASK_MAX_CONCURRENT_LOCAL_RUNS",
                "must be a positive integer",
            ))?;

        let service_url = std::env::var("CLOUDTASK_SERVICE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            max_concurrent_dispatches,
            max_concurrent_local_runs,
            service_url,
            cleanup: TaskCleanupWorkerConfig::from_env(),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_optional(guard: &mut EnvGuard) {
        for key in [
            "CLOUDTASK_HTTP_PORT",
            "CLOUDTASK_MAX_CONCURRENT_DISPATCHES",
            "CLOUDTASK_MAX_CONCURRENT_LOCAL_RUNS",
            "CLOUDTASK_SERVICE_URL",
            "CLOUDTASK_TASK_ARCHIVE_ENABLED",
            "CLOUDTASK_TASK_ARCHIVE_HOURS",
            "CLOUDTASK_TASK_ARCHIVE_BATCH",
            "CLOUDTASK_TASK_ARCHIVE_POLL_SECS",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CLOUDTASK_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.max_concurrent_dispatches, 32);
        assert_eq!(config.max_concurrent_local_runs, 256);
        assert!(config.service_url.is_none());
        assert!(config.cleanup.enabled);
        assert_eq!(config.cleanup.max_age.as_secs(), 720 * 3600);
        assert_eq!(config.cleanup.batch_size, 100);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_optional(&mut guard);
        guard.set("CLOUDTASK_DATABASE_URL", "sqlite:/var/lib/cloudtask/tasks.db");
        guard.set("CLOUDTASK_HTTP_PORT", "9090");
        guard.set("CLOUDTASK_MAX_CONCURRENT_DISPATCHES", "4");
        guard.set("CLOUDTASK_MAX_CONCURRENT_LOCAL_RUNS", "16");
        guard.set("CLOUDTASK_SERVICE_URL", "http://region-1:9090");
        guard.set("CLOUDTASK_TASK_ARCHIVE_ENABLED", "false");
        guard.set("CLOUDTASK_TASK_ARCHIVE_HOURS", "24");

        let config = Config::from_env().unwrap();

        assert_eq!(config.http_addr.port(), 9090);
        assert_eq!(config.max_concurrent_dispatches, 4);
        assert_eq!(config.max_concurrent_local_runs, 16);
        assert_eq!(config.service_url.as_deref(), Some("http://region-1:9090"));
        assert!(!config.cleanup.enabled);
        assert_eq!(config.cleanup.max_age.as_secs(), 24 * 3600);
    }

    #[test]
    fn test_oversized_archive_hours_fall_back_to_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_optional(&mut guard);
        guard.set("CLOUDTASK_DATABASE_URL", "sqlite::memory:");
        guard.set("CLOUDTASK_TASK_ARCHIVE_HOURS", &u64::MAX.to_string());

        let config = Config::from_env().unwrap();
        assert_eq!(config.cleanup.max_age.as_secs(), 720 * 3600);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("CLOUDTASK_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CLOUDTASK_DATABASE_URL")));
        assert!(err.to_string().contains("CLOUDTASK_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_optional(&mut guard);
        guard.set("CLOUDTASK_DATABASE_URL", "sqlite::memory:");
        guard.set("CLOUDTASK_HTTP_PORT", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CLOUDTASK_HTTP_PORT", _)));
    }

    #[test]
    fn test_config_zero_dispatches_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_optional(&mut guard);
        guard.set("CLOUDTASK_DATABASE_URL", "sqlite::memory:");
        guard.set("CLOUDTASK_MAX_CONCURRENT_DISPATCHES", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CLOUDTASK_MAX_CONCURRENT_DISPATCHES", _)
        ));
    }

    #[test]
    fn test_blank_service_url_is_unset() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_optional(&mut guard);
        guard.set("CLOUDTASK_DATABASE_URL", "sqlite::memory:");
        guard.set("CLOUDTASK_SERVICE_URL", "  ");

        assert!(Config::from_env().unwrap().service_url.is_none());
    }
}
