// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cloudtask-core.
//!
//! Two layers are kept apart:
//! - [`CoreError`] covers runtime and persistence faults and maps to stable
//!   machine-readable codes for the HTTP surface.
//! - [`TaskError`] is what stage handlers produce and observe. It carries an
//!   [`ErrorKind`] tag and is serialized into terminal task results and into
//!   the payload a parent receives from a failed child.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while managing task records.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Task was not found in the store.
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// No task kind is registered under this name.
    #[error("Task kind '{kind}' is not registered")]
    KindNotFound {
        /// The unknown kind name.
        kind: String,
    },

    /// A task kind was registered twice.
    #[error("Task kind '{kind}' is already registered")]
    DuplicateKind {
        /// The duplicated kind name.
        kind: String,
    },

    /// The task's stage no longer matches the stage the caller expected.
    #[error("Task '{task_id}' is at stage '{actual}', expected '{expected}'")]
    StageConflict {
        /// The task ID.
        task_id: String,
        /// The stage the caller expected.
        expected: String,
        /// The stage actually stored.
        actual: String,
    },

    /// The transition was denied because cancellation was requested.
    #[error("Task '{task_id}' has been cancelled")]
    TaskCancelled {
        /// The task ID.
        task_id: String,
    },

    /// The task already reached a terminal stage.
    #[error("Task '{task_id}' is already terminated at stage '{stage}'")]
    TaskTerminated {
        /// The task ID.
        task_id: String,
        /// The terminal stage.
        stage: String,
    },

    /// Waiting for a task to terminate exceeded the caller's deadline.
    #[error("Timed out waiting for task '{task_id}'")]
    WaitTimeout {
        /// The task ID.
        task_id: String,
    },

    /// The runtime is shutting down and no longer accepts work.
    #[error("Task runtime is shut down")]
    ShutDown,

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::KindNotFound { .. } => "KIND_NOT_FOUND",
            Self::DuplicateKind { .. } => "DUPLICATE_KIND",
            Self::StageConflict { .. } => "STAGE_CONFLICT",
            Self::TaskCancelled { .. } => "TASK_CANCELLED",
            Self::TaskTerminated { .. } => "TASK_TERMINATED",
            Self::WaitTimeout { .. } => "WAIT_TIMEOUT",
            Self::ShutDown => "SHUT_DOWN",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Classification tag carried by every [`TaskError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The referenced remote object does not exist.
    NotFound,
    /// The provider has no implementation for the capability.
    NotImplemented,
    /// The provider explicitly does not support the capability.
    NotSupported,
    /// A bounded wait exhausted its deadline.
    Timeout,
    /// Parameters are structurally inadmissible.
    Validation,
    /// Any other downstream failure.
    Remote,
    /// Runtime or persistence fault.
    Internal,
    /// The task was cancelled.
    Cancelled,
}

impl ErrorKind {
    /// Stable snake_case name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NotImplemented => "not_implemented",
            Self::NotSupported => "not_supported",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Remote => "remote",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified error produced by stage handlers and capability ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// Classification tag.
    pub kind: ErrorKind,
    /// Human-readable reason, preserved verbatim from the producer.
    pub message: String,
    /// Structured context, e.g. the subtask summary of a failed fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    /// Create an error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Remote object does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Capability not implemented by the provider.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, message)
    }

    /// Capability not supported by the provider.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    /// A bounded wait ran out of time.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Inadmissible parameters.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Opaque downstream failure.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Remote, message)
    }

    /// Runtime or persistence fault.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Task cancellation.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// True for [`ErrorKind::NotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// True when the provider lacks the capability altogether.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.kind, ErrorKind::NotImplemented | ErrorKind::NotSupported)
    }

    /// Decode a failure reason received from a child or an agent callback.
    ///
    /// Structured reasons round-trip; anything else (usually a plain string)
    /// becomes a [`ErrorKind::Remote`] error with the text preserved.
    pub fn from_reason(reason: &Value) -> Self {
        if let Ok(err) = serde_json::from_value::<TaskError>(reason.clone()) {
            return err;
        }
        match reason {
            Value::String(s) => Self::remote(s.clone()),
            Value::Null => Self::remote("unknown error"),
            other => Self::remote(other.to_string()),
        }
    }
}

impl From<CoreError> for TaskError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TaskCancelled { .. } => TaskError::cancelled(err.to_string()),
            CoreError::ValidationError { .. } => TaskError::validation(err.to_string()),
            other => TaskError::internal(other.to_string()),
        }
    }
}
