// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task record model and the payload envelope exchanged between stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::TaskError;

/// Stage stored on a freshly created task.
pub const INIT_STAGE: &str = "init";
/// Handler name the `init` stage dispatches to.
pub const INIT_HANDLER: &str = "OnInit";
/// Terminal stage for success.
pub const STAGE_COMPLETE: &str = "complete";
/// Terminal stage for failure.
pub const STAGE_FAILED: &str = "failed";
/// Suffix naming the failure variant of a continuation stage.
pub const FAILED_SUFFIX: &str = "Failed";

/// Envelope key marking a callback body as success (`"OK"`) or failure.
pub const STATUS_KEY: &str = "__status__";
/// Envelope key carrying the failure reason.
pub const REASON_KEY: &str = "__reason__";
/// Envelope key naming the failed task's kind in remote notifications.
pub const TASK_NAME_KEY: &str = "__task_name__";
/// Failure marker for [`STATUS_KEY`] in remote notifications.
pub const STATUS_ERROR: &str = "error";
/// Success marker for [`STATUS_KEY`].
pub const STATUS_OK: &str = "OK";

/// Caller identity carried on every downstream call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCred {
    /// Acting user.
    #[serde(default)]
    pub user_id: String,
    /// Owning project (tenant).
    #[serde(default)]
    pub project_id: String,
    /// Bearer token forwarded to agents.
    #[serde(default)]
    pub token: String,
}

impl UserCred {
    /// Credential for a user within a project.
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            token: String::new(),
        }
    }

    /// Attach a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

/// Names the resource(s) a task acts upon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Resource kind, e.g. `guest` or `dns_zone`.
    pub kind: String,
    /// One id for singleton tasks, several for batch tasks.
    pub ids: Vec<String>,
    /// Display name of the (first) object, kept for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ObjectRef {
    /// Reference a single resource.
    pub fn single(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ids: vec![id.into()],
            name: None,
        }
    }

    /// Reference a set of resources of one kind.
    pub fn batch<I, S>(kind: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: kind.into(),
            ids: ids.into_iter().map(Into::into).collect(),
            name: None,
        }
    }

    /// Set the display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// First id, if any.
    pub fn primary_id(&self) -> Option<&str> {
        self.ids.first().map(String::as_str)
    }
}

/// One completed stage, appended on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    /// Stage that was left.
    pub stage: String,
    /// When it was left.
    pub completed_at: DateTime<Utc>,
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stage `complete`.
    Complete,
    /// Stage `failed`.
    Failed,
}

impl Outcome {
    /// The terminal stage name written for this outcome.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Complete => STAGE_COMPLETE,
            Self::Failed => STAGE_FAILED,
        }
    }
}

/// Which handler of a continuation pair a payload selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Handler named exactly by the stage.
    Success,
    /// Handler named by the stage plus [`FAILED_SUFFIX`].
    Failure,
}

/// Durable representation of one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Stable opaque identifier.
    pub id: String,
    /// Registered kind name; immutable.
    pub kind: String,
    /// Current stage, `init` until the first transition.
    pub stage: String,
    /// Creation parameters plus cross-stage scratch data.
    pub params: Map<String, Value>,
    /// Caller identity.
    pub user_cred: UserCred,
    /// Target resource(s).
    pub object: Option<ObjectRef>,
    /// Task signalled when this one terminates.
    pub parent_id: Option<String>,
    /// Parent stage invoked on success; failure appends [`FAILED_SUFFIX`].
    pub parent_stage: Option<String>,
    /// Remote endpoint POSTed with the terminal result, for parents that
    /// live in another service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_notify_url: Option<String>,
    /// Quota reservation released exactly once on termination.
    pub pending_usage: Option<Value>,
    /// Set by a cancel request; honoured at the next transition or dispatch.
    pub cancel_requested: bool,
    /// Stages left so far, oldest first.
    pub stage_history: Vec<StageHistoryEntry>,
    /// Percentage done, 0 to 100.
    #[serde(default)]
    pub progress: f32,
    /// Terminal payload.
    pub result: Option<Value>,
    /// Bumped on every write.
    pub version: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// First dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Termination time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A new record at the `init` stage.
    pub fn new(kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            stage: INIT_STAGE.to_string(),
            params: Map::new(),
            user_cred: UserCred::default(),
            object: None,
            parent_id: None,
            parent_stage: None,
            parent_notify_url: None,
            pending_usage: None,
            cancel_requested: false,
            stage_history: Vec::new(),
            progress: 0.0,
            result: None,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// True once the task reached `complete` or `failed`.
    pub fn is_terminal(&self) -> bool {
        is_terminal_stage(&self.stage)
    }

    /// Terminal outcome, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.stage.as_str() {
            STAGE_COMPLETE => Some(Outcome::Complete),
            STAGE_FAILED => Some(Outcome::Failed),
            _ => None,
        }
    }

    /// Name of the handler the current stage dispatches to.
    pub fn handler_stage(&self) -> &str {
        if self.stage == INIT_STAGE {
            INIT_HANDLER
        } else {
            &self.stage
        }
    }

    /// Error stored on a failed task, if any.
    pub fn failure(&self) -> Option<TaskError> {
        if self.outcome() != Some(Outcome::Failed) {
            return None;
        }
        let reason = self.result.as_ref()?.get(REASON_KEY)?;
        Some(TaskError::from_reason(reason))
    }

    /// Merge `params` into the record, last write wins per key.
    pub fn merge_params(&mut self, params: &Map<String, Value>) {
        for (k, v) in params {
            self.params.insert(k.clone(), v.clone());
        }
    }
}

/// True for the two terminal stage names.
pub fn is_terminal_stage(stage: &str) -> bool {
    stage == STAGE_COMPLETE || stage == STAGE_FAILED
}

/// Payload handed to a stage handler.
///
/// Success carries whatever the producer returned (empty object on the
/// initial dispatch); failure carries the classified reason.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Producer reported success.
    Success(Value),
    /// Producer reported failure.
    Failure(TaskError),
}

impl Payload {
    /// Empty success payload used for the `init` dispatch.
    pub fn empty() -> Self {
        Self::Success(Value::Object(Map::new()))
    }

    /// Decode a callback body.
    ///
    /// A body carrying `__status__` with any value other than `"OK"` is a
    /// failure; its reason is read from `__reason__`.
    pub fn from_json(body: Value) -> Self {
        if let Some(status) = body.get(STATUS_KEY)
            && status.as_str() != Some(STATUS_OK)
        {
            let reason = body.get(REASON_KEY).cloned().unwrap_or(Value::Null);
            return Self::Failure(TaskError::from_reason(&reason));
        }
        Self::Success(body)
    }

    /// Encode for transport; inverse of [`Payload::from_json`].
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success(v) => v.clone(),
            Self::Failure(err) => json!({
                STATUS_KEY: "error",
                REASON_KEY: err,
            }),
        }
    }

    /// Handler polarity this payload selects.
    pub fn polarity(&self) -> Polarity {
        match self {
            Self::Success(_) => Polarity::Success,
            Self::Failure(_) => Polarity::Failure,
        }
    }

    /// The success value, if any.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success(v) => Some(v),
            Self::Failure(_) => None,
        }
    }

    /// The failure reason, if any.
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Self::Success(_) => None,
            Self::Failure(e) => Some(e),
        }
    }
}

/// Terminal result written for a failed task.
pub(crate) fn failure_result(stage: &str, err: &TaskError) -> Value {
    json!({
        REASON_KEY: err,
        "stage": stage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_init_stage_maps_to_on_init() {
        let mut record = TaskRecord::new("DnsZoneCreateTask");
        assert_eq!(record.stage, INIT_STAGE);
        assert_eq!(record.handler_stage(), "OnInit");

        record.stage = "OnZoneReady".to_string();
        assert_eq!(record.handler_stage(), "OnZoneReady");
        assert!(!record.is_terminal());

        record.stage = STAGE_FAILED.to_string();
        assert!(record.is_terminal());
        assert_eq!(record.outcome(), Some(Outcome::Failed));
    }

    #[test]
    fn test_payload_from_json_detects_failure() {
        let payload = Payload::from_json(json!({"__status__": "error", "__reason__": "disk busy"}));
        match payload {
            Payload::Failure(err) => {
                assert_eq!(err.kind, ErrorKind::Remote);
                assert_eq!(err.message, "disk busy");
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let ok = Payload::from_json(json!({"__status__": "OK", "status": "running"}));
        assert_eq!(ok.polarity(), Polarity::Success);

        let plain = Payload::from_json(json!({"status": "running"}));
        assert_eq!(plain.data().unwrap()["status"], "running");
    }

    #[test]
    fn test_failure_payload_keeps_classification() {
        let payload = Payload::Failure(TaskError::timeout("pool stuck in CHANGING"));
        let decoded = Payload::from_json(payload.to_json());
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_record_failure_reads_reason() {
        let mut record = TaskRecord::new("X");
        record.stage = STAGE_FAILED.to_string();
        record.result = Some(failure_result("OnInit", &TaskError::not_found("zone gone")));
        let err = record.failure().unwrap();
        assert!(err.is_not_found());
        assert_eq!(err.message, "zone gone");
    }

    #[test]
    fn test_merge_params_last_write_wins() {
        let mut record = TaskRecord::new("X");
        record.params.insert("a".into(), json!(1));
        let mut update = Map::new();
        update.insert("a".into(), json!(2));
        update.insert("b".into(), json!("x"));
        record.merge_params(&update);
        assert_eq!(record.params["a"], json!(2));
        assert_eq!(record.params["b"], json!("x"));
    }
}
