//! REST endpoints for submitting, inspecting and cancelling work requests.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Build the Axum router.
pub fn routes(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route("/api/tasks", get(list_tasks))
        .route("/api/queue/status", get(queue_status))
        .route("/api/task/{id}/status", get(task_status))
        .route("/api/task/{id}/logs", get(task_logs))
        .route("/api/task/{id}/stop", post(stop_task))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

type ApiResponse = (StatusCode, Json<Value>);

fn error_response(err: EngineError) -> ApiResponse {
    let status = match &err {
        EngineError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::Database(_) | EngineError::Io(_) => {
            error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": err.to_string()})))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid request ID"})),
        )
    })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "run-orchestrator"
    }))
}

// ── Submission ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    description: String,
}

async fn submit(State(state): State<AppState>, Json(body): Json<SubmitRequest>) -> impl IntoResponse {
    if body.description.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Task description is required"})),
        );
    }

    match state.engine.submit(body.description).await {
        Ok(id) => {
            info!(request_id = %id, "Task submitted");
            (
                StatusCode::OK,
                Json(json!({"request_id": id, "status": "queued"})),
            )
        }
        Err(e) => error_response(e),
    }
}

// ── Inspection ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    match state.engine.list_recent(params.limit).await {
        Ok(tasks) => (StatusCode::OK, Json(json!({"tasks": tasks}))),
        Err(e) => error_response(e),
    }
}

async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.queue_status().await {
        Ok(status) => (StatusCode::OK, Json(json!(status))),
        Err(e) => error_response(e),
    }
}

async fn task_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.get_request(id).await {
        Ok(request) => (StatusCode::OK, Json(json!(request))),
        Err(e) => error_response(e),
    }
}

async fn task_logs(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let request = match state.engine.get_request(id).await {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };
    match state.engine.get_logs(id).await {
        Ok(logs) => (
            StatusCode::OK,
            Json(json!({"request": request, "logs": logs})),
        ),
        Err(e) => error_response(e),
    }
}

// ── Cancellation ────────────────────────────────────────────────────────

async fn stop_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.cancel(id).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use super::*;
    use crate::config::{EngineConfig, SchedulerConfig};
    use crate::engine::command_unit::CommandUnit;
    use crate::jobs::{JobManager, JsonArtifactReader, SlurmScheduler};
    use crate::store::LibSqlBackend;

    async fn test_app(command: &str) -> (Router, Engine, tempfile::TempDir) {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let jobs = Arc::new(JobManager::new(
            Arc::new(SlurmScheduler::new(SchedulerConfig::default())),
            store.clone(),
            Arc::new(JsonArtifactReader::new("result.json")),
        ));
        let config = EngineConfig {
            max_concurrent_runs: 1,
            max_queue_size: 1,
            work_dir: work.path().to_path_buf(),
            terminate_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        let unit = Arc::new(CommandUnit::new(command).with_poll_interval(Duration::from_millis(10)));
        let engine = Engine::new(config, store, unit, jobs).unwrap();
        (routes(engine.clone()), engine, work)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_for(app: &Router, id: &str, status: &str) -> Value {
        let uri = format!("/api/task/{id}/status");
        for _ in 0..500 {
            let (_, body) = send(app, "GET", &uri, None).await;
            if body["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_reports_ok() {
        let (app, _engine, _work) = test_app("cat").await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_runs_to_completion() {
        let (app, _engine, _work) = test_app("cat").await;
        let (status, body) = send(&app, "POST", "/submit", Some(json!({"description": "hello"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");
        let id = body["request_id"].as_str().unwrap().to_string();

        let done = wait_for(&app, &id, "completed").await;
        assert_eq!(done["result"].as_str().map(str::trim), Some("hello"));

        let (status, logs) = send(&app, "GET", &format!("/api/task/{id}/logs"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs["request"]["id"], id.as_str());
        let entries = logs["logs"].as_array().unwrap();
        assert!(entries.iter().any(|l| l["kind"] == "output" && l["content"] == "hello"));

        let (status, list) = send(&app, "GET", "/api/tasks?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_description_rejected() {
        let (app, _engine, _work) = test_app("cat").await;
        let (status, _) = send(&app, "POST", "/submit", Some(json!({"description": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "POST", "/submit", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capacity_and_cancel_map_to_status_codes() {
        let (app, _engine, _work) = test_app("sleep 30").await;
        let (_, first) = send(&app, "POST", "/submit", Some(json!({"description": "a"}))).await;
        let (_, second) = send(&app, "POST", "/submit", Some(json!({"description": "b"}))).await;
        let (status, _) = send(&app, "POST", "/submit", Some(json!({"description": "c"}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, queue) = send(&app, "GET", "/api/queue/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(queue["max_concurrent"], 1);

        let queued_id = second["request_id"].as_str().unwrap();
        let (status, outcome) =
            send(&app, "POST", &format!("/api/task/{queued_id}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["in_flight"], false);
        let (status, _) = send(&app, "POST", &format!("/api/task/{queued_id}/stop"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let running_id = first["request_id"].as_str().unwrap();
        wait_for(&app, running_id, "running").await;
        let (status, outcome) =
            send(&app, "POST", &format!("/api/task/{running_id}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["success"], true);
        wait_for(&app, running_id, "cancelled").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_and_unknown_ids() {
        let (app, _engine, _work) = test_app("cat").await;
        let (status, _) = send(&app, "GET", "/api/task/not-a-uuid/status", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = Uuid::new_v4();
        let (status, body) = send(&app, "GET", &format!("/api/task/{missing}/status"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
        let (status, _) = send(&app, "POST", &format!("/api/task/{missing}/stop"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
