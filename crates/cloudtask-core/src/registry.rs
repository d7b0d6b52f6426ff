// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task kind registry.
//!
//! A [`TaskKind`] bundles the stage handlers of one kind of operation. Handlers
//! are keyed by stage name; the failure variant of stage `OnX` is registered
//! under `OnXFailed`. The registry is filled once at startup and frozen when
//! handed to the runtime builder.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::TaskContext;
use crate::error::{CoreError, TaskError};
use crate::record::{FAILED_SUFFIX, Payload, Polarity, is_terminal_stage};

/// Future returned by a stage handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// A stage handler: receives the task context and the incoming payload.
pub type StageHandler = Arc<dyn Fn(TaskContext, Payload) -> HandlerFuture + Send + Sync>;

/// Behaviour bundle for one task kind.
pub struct TaskKind {
    name: String,
    batch: bool,
    handlers: HashMap<String, StageHandler>,
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<&String> = self.handlers.keys().collect();
        stages.sort();
        f.debug_struct("TaskKind")
            .field("name", &self.name)
            .field("batch", &self.batch)
            .field("stages", &stages)
            .finish()
    }
}

impl TaskKind {
    /// Start describing a kind.
    pub fn builder(name: impl Into<String>) -> TaskKindBuilder {
        TaskKindBuilder {
            name: name.into(),
            batch: false,
            handlers: HashMap::new(),
            error: None,
        }
    }

    /// Registered kind name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `OnInit` receives an ordered set of objects.
    pub fn is_batch(&self) -> bool {
        self.batch
    }

    /// Resolve the handler for `stage` with the given polarity.
    pub fn handler(&self, stage: &str, polarity: Polarity) -> Option<&StageHandler> {
        match polarity {
            Polarity::Success => self.handlers.get(stage),
            Polarity::Failure => self.handlers.get(&format!("{}{}", stage, FAILED_SUFFIX)),
        }
    }

    /// Registered handler names, sorted.
    pub fn stages(&self) -> Vec<&str> {
        let mut stages: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        stages.sort_unstable();
        stages
    }
}

/// Builder for [`TaskKind`].
pub struct TaskKindBuilder {
    name: String,
    batch: bool,
    handlers: HashMap<String, StageHandler>,
    error: Option<CoreError>,
}

impl TaskKindBuilder {
    /// Mark the kind as batch.
    pub fn batch(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Register the handler for `stage`.
    ///
    /// Use the `...Failed` name to register a failure handler.
    pub fn on<F, Fut>(mut self, stage: &str, handler: F) -> Self
    where
        F: Fn(TaskContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        if stage.is_empty() || is_terminal_stage(stage) {
            self.error = Some(CoreError::validation(
                "stage",
                format!("'{}' cannot carry a handler on kind {}", stage, self.name),
            ));
            return self;
        }
        if self.handlers.contains_key(stage) {
            self.error = Some(CoreError::validation(
                "stage",
                format!("handler {} registered twice on kind {}", stage, self.name),
            ));
            return self;
        }

        let handler: StageHandler =
            Arc::new(move |ctx: TaskContext, payload: Payload| -> HandlerFuture {
                Box::pin(handler(ctx, payload))
            });
        self.handlers.insert(stage.to_string(), handler);
        self
    }

    /// Finish the description.
    pub fn build(self) -> Result<TaskKind, CoreError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.name.is_empty() {
            return Err(CoreError::validation("kind", "kind name must not be empty"));
        }
        Ok(TaskKind {
            name: self.name,
            batch: self.batch,
            handlers: self.handlers,
        })
    }
}

/// Process-wide mapping from kind name to [`TaskKind`].
#[derive(Debug, Default)]
pub struct TaskKindRegistry {
    kinds: HashMap<String, Arc<TaskKind>>,
}

impl TaskKindRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind. Registering the same name twice is an error.
    pub fn register(&mut self, kind: TaskKind) -> Result<(), CoreError> {
        if self.kinds.contains_key(kind.name()) {
            return Err(CoreError::DuplicateKind {
                kind: kind.name().to_string(),
            });
        }
        self.kinds.insert(kind.name().to_string(), Arc::new(kind));
        Ok(())
    }

    /// Look up a kind by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<TaskKind>> {
        self.kinds.get(name).cloned()
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
