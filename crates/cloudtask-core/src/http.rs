// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface for submissions, callbacks and inspection.
//!
//! | Route | Action |
//! |-------|--------|
//! | `GET /health` | store connectivity |
//! | `POST /tasks` | submit a task; `X-Task-Notify-Url` names a remote parent |
//! | `GET /tasks` | list tasks (`parent_id`, `kind`, `stage`, `incomplete`, `limit`) |
//! | `GET /tasks/{id}` | one record |
//! | `POST /tasks/{id}` | callback; `X-Task-Stage` guards against replay |
//! | `POST /tasks/{id}/cancel` | cancel a task and its descendants |

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::context::{HEADER_TASK_ID, HEADER_TASK_NOTIFY_URL, HEADER_TASK_STAGE};
use crate::error::CoreError;
use crate::persistence::TaskFilter;
use crate::record::{ObjectRef, TaskRecord, UserCred};
use crate::runtime::{TaskRuntime, TaskSubmission};

/// Build the router over a running [`TaskRuntime`].
pub fn build_router(runtime: TaskRuntime) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).post(task_callback))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .with_state(runtime)
}

/// Error body returned by every route.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::TaskNotFound { .. } | CoreError::KindNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            CoreError::TaskTerminated { .. }
            | CoreError::StageConflict { .. }
            | CoreError::TaskCancelled { .. }
            | CoreError::DuplicateKind { .. } => StatusCode::CONFLICT,
            CoreError::ValidationError { .. } => StatusCode::BAD_REQUEST,
            CoreError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::WaitTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error": self.0.error_code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

async fn health(State(runtime): State<TaskRuntime>) -> Response {
    match runtime.store().health_check().await {
        Ok(true) => Json(json!({"status": "ok"})).into_response(),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    kind: String,
    #[serde(default)]
    object: Option<ObjectRef>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    user_cred: Option<UserCred>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    parent_stage: Option<String>,
    #[serde(default)]
    parent_notify_url: Option<String>,
    #[serde(default)]
    pending_usage: Option<Value>,
}

async fn submit_task(
    State(runtime): State<TaskRuntime>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut submission = TaskSubmission::new(req.kind).params(req.params);
    if let Some(object) = req.object {
        submission = submission.object(object);
    }
    if let Some(cred) = req.user_cred {
        submission = submission.user_cred(cred);
    }
    if let Some(usage) = req.pending_usage {
        submission = submission.pending_usage(usage);
    }
    // A task submitted from another service's stage reports back to it.
    let notify_url = req.parent_notify_url.or_else(|| {
        headers
            .get(HEADER_TASK_NOTIFY_URL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    if let Some(url) = notify_url {
        submission = submission.parent_notify_url(url);
        if let Some(parent_id) = headers.get(HEADER_TASK_ID).and_then(|v| v.to_str().ok()) {
            submission = submission.remote_parent_id(parent_id);
        }
    }
    match (req.parent_id, req.parent_stage) {
        (Some(id), Some(stage)) => submission = submission.parent(id, stage),
        (None, None) => {}
        _ => {
            return Err(CoreError::validation(
                "parent",
                "parent_id and parent_stage must be given together",
            )
            .into());
        }
    }

    let task_id = runtime.submit(submission).await?;
    Ok((StatusCode::CREATED, Json(json!({"task_id": task_id}))))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    parent_id: Option<String>,
    kind: Option<String>,
    stage: Option<String>,
    object_id: Option<String>,
    #[serde(default)]
    incomplete: bool,
    limit: Option<i64>,
}

async fn list_tasks(
    State(runtime): State<TaskRuntime>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskRecord>>, ApiError> {
    let filter = TaskFilter {
        parent_id: query.parent_id,
        kind: query.kind,
        stage: query.stage,
        object_id: query.object_id,
        incomplete_only: query.incomplete,
        limit: query.limit,
    };
    Ok(Json(runtime.list(&filter).await?))
}

async fn get_task(
    State(runtime): State<TaskRuntime>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    Ok(Json(runtime.get(&id).await?))
}

async fn task_callback(
    State(runtime): State<TaskRuntime>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let expected_stage = headers
        .get(HEADER_TASK_STAGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    runtime
        .callback(&id, body, expected_stage.as_deref())
        .await?;
    Ok(Json(json!({"result": "ok"})))
}

async fn cancel_task(
    State(runtime): State<TaskRuntime>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    runtime.cancel(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"task_id": id}))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::persistence::MemoryTaskStore;
    use crate::ports::memory::{InMemoryResources, RecordingNotifier, RecordingQuota};
    use crate::registry::{TaskKind, TaskKindRegistry};
    use crate::runtime::TaskRuntimeBuilder;
    use crate::{Payload, TaskContext, TaskError};

    async fn wait_callback(mut ctx: TaskContext, _payload: Payload) -> Result<(), TaskError> {
        ctx.set_stage("OnRemoteDone", None).await
    }

    async fn remote_done(mut ctx: TaskContext, payload: Payload) -> Result<(), TaskError> {
        ctx.set_stage_complete(payload.data().cloned()).await
    }

    async fn runtime() -> TaskRuntime {
        let mut registry = TaskKindRegistry::new();
        registry
            .register(
                TaskKind::builder("RemoteTask")
                    .on("OnInit", wait_callback)
                    .on("OnRemoteDone", remote_done)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        TaskRuntimeBuilder::new()
            .with_store(Arc::new(MemoryTaskStore::new()))
            .with_registry(registry)
            .with_resources(Arc::new(InMemoryResources::new()))
            .with_quota(Arc::new(RecordingQuota::new()))
            .with_notifier(Arc::new(RecordingNotifier::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(runtime().await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_then_callback_completes() {
        let runtime = runtime().await;
        let app = build_router(runtime.clone());

        let response = app
            .clone()
            .oneshot(post("/tasks", json!({"kind": "RemoteTask"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task_id = json_body(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        runtime.wait_idle().await;
        assert_eq!(runtime.get(&task_id).await.unwrap().stage, "OnRemoteDone");

        // A replay addressed to the stage the task already left is dropped.
        let mut stale = post(&format!("/tasks/{}", task_id), json!({"__status__": "OK"}));
        stale
            .headers_mut()
            .insert(HEADER_TASK_STAGE, "init".parse().unwrap());
        let response = app.clone().oneshot(stale).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        runtime.wait_idle().await;
        assert_eq!(runtime.get(&task_id).await.unwrap().stage, "OnRemoteDone");

        let mut callback = post(
            &format!("/tasks/{}", task_id),
            json!({"__status__": "OK", "power": "off"}),
        );
        callback
            .headers_mut()
            .insert(HEADER_TASK_STAGE, "OnRemoteDone".parse().unwrap());
        let response = app.clone().oneshot(callback).await.unwrap();
        assert_eq!(json_body(response).await, json!({"result": "ok"}));

        let record = runtime
            .wait_terminal(&task_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.stage, "complete");
        assert_eq!(record.result.unwrap()["power"], "off");

        let response = app
            .oneshot(post(&format!("/tasks/{}/cancel", task_id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "TASK_TERMINATED");
    }

    #[tokio::test]
    async fn test_submit_takes_notify_url_from_header() {
        let runtime = runtime().await;
        let app = build_router(runtime.clone());

        let mut request = post("/tasks", json!({"kind": "RemoteTask"}));
        request.headers_mut().insert(
            HEADER_TASK_NOTIFY_URL,
            "http://region-2.test/tasks/p-1".parse().unwrap(),
        );
        request
            .headers_mut()
            .insert(HEADER_TASK_ID, "p-1".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task_id = json_body(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let record = runtime.get(&task_id).await.unwrap();
        assert_eq!(
            record.parent_notify_url.as_deref(),
            Some("http://region-2.test/tasks/p-1")
        );
        assert_eq!(record.parent_id.as_deref(), Some("p-1"));
        assert_eq!(record.parent_stage, None);
    }

    #[tokio::test]
    async fn test_unknown_task_and_kind() {
        let app = build_router(runtime().await);

        let response = app
            .clone()
            .oneshot(Request::get("/tasks/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(post("/tasks", json!({"kind": "Nope"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "KIND_NOT_FOUND");

        let response = app
            .oneshot(post(
                "/tasks",
                json!({"kind": "RemoteTask", "parent_id": "p"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
