use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::{ConveyorError, ConveyorResult, Task, TaskStore, WorkflowSnapshot};
use conveyor_engine::{
    submit, DeadLetterEntry, DeadLetterQueue, HealthMonitor, HealthStatus, MetricsSnapshot,
    PoolMetrics,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    /// Task storage, shared with the engine.
    pub store: Arc<dyn TaskStore>,
    /// Pool metrics, read-only here.
    pub metrics: Arc<PoolMetrics>,
    /// Health grading over the metrics.
    pub health: Arc<HealthMonitor>,
    /// Dead-letter queue for listing and remediation.
    pub dlq: Arc<DeadLetterQueue>,
}

/// The HTTP query and submission surface.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router over shared state.
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/tasks", post(submit_handler))
            .route("/tasks/{id}", get(task_handler))
            .route("/dlq", get(dlq_list_handler))
            .route("/dlq/{id}/requeue", post(dlq_requeue_handler))
            .route("/dlq/{id}/resolve", post(dlq_resolve_handler))
            .with_state(state)
    }

    /// Bind and serve until the process stops.
    pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> ConveyorResult<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "Gateway listening");
        axum::serve(listener, Self::build(state))
            .await
            .map_err(|e| ConveyorError::Gateway(e.to_string()))
    }
}

/// Error payload for every non-2xx response.
#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

enum GatewayError {
    NotFound(String),
    Internal(ConveyorError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            GatewayError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            GatewayError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        (status, Json(ApiError { error: message })).into_response()
    }
}

impl From<ConveyorError> for GatewayError {
    fn from(err: ConveyorError) -> Self {
        // DLQ lookups report unknown entries as engine errors.
        match err {
            ConveyorError::Engine(message) => GatewayError::NotFound(message),
            other => GatewayError::Internal(other),
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.health.report();
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    priority: i32,
    /// Short-task heuristic for the scheduler, optional.
    #[serde(default)]
    estimated_duration_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: Uuid,
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), GatewayError> {
    let task_id = submit(
        state.store.as_ref(),
        request.payload,
        request.priority,
        request.estimated_duration_secs,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { task_id })))
}

/// Task record plus its latest workflow snapshot, if one exists yet.
#[derive(Debug, Serialize)]
struct TaskDetail {
    task: Task,
    workflow: Option<WorkflowSnapshot>,
}

async fn task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskDetail>, GatewayError> {
    let Some(task) = state.store.get(id).await? else {
        return Err(GatewayError::NotFound(format!("no task {id}")));
    };
    let workflow = state.store.workflow_state(id).await?;
    Ok(Json(TaskDetail { task, workflow }))
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    limit: Option<usize>,
}

async fn dlq_list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DlqQuery>,
) -> Json<Vec<DeadLetterEntry>> {
    Json(state.dlq.list(query.limit.unwrap_or(50)))
}

async fn dlq_requeue_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmitResponse>, GatewayError> {
    let task_id = state.dlq.requeue(id, state.store.as_ref()).await?;
    Ok(Json(SubmitResponse { task_id }))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    notes: String,
}

async fn dlq_resolve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> Result<StatusCode, GatewayError> {
    state.dlq.resolve(id, request.notes)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use conveyor_core::{TaskStatus, Workflow};
    use conveyor_engine::{CircuitBreakerRegistry, HealthThresholds};
    use conveyor_store::MemoryTaskStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let metrics = Arc::new(PoolMetrics::new(4));
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let dlq = Arc::new(DeadLetterQueue::new());
        let health = Arc::new(HealthMonitor::new(
            HealthThresholds::default(),
            Arc::clone(&metrics),
            breakers,
            Arc::clone(&dlq),
        ));
        Arc::new(AppState {
            store,
            metrics,
            health,
            dlq,
        })
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = GatewayServer::build(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["recommendations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = test_state();
        state.metrics.workflow_started();
        let app = GatewayServer::build(state);
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["active_count"], 1);
        assert_eq!(body["max_concurrent"], 4);
    }

    #[tokio::test]
    async fn test_submit_then_fetch_task() {
        let state = test_state();
        let app = GatewayServer::build(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(
                Request::post("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"payload": {"repo": "a/b"}, "priority": 7}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task_id = json_body(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::get(format!("/tasks/{task_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["task"]["priority"], 7);
        assert_eq!(body["task"]["status"], "queued");
        assert!(body["workflow"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let app = GatewayServer::build(test_state());
        let response = app
            .oneshot(
                Request::get(format!("/tasks/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dlq_list_requeue_and_resolve() {
        let state = test_state();

        // Seed a failed task with a matching dead-letter entry.
        let mut task = Task::new(serde_json::Value::Null, 5);
        task.status = TaskStatus::Failed {
            reason: "retries exhausted".into(),
        };
        task.retry_count = 4;
        state.store.persist(&task).await.unwrap();
        let entry_id = state
            .dlq
            .enqueue(task.id, Workflow::new(task.id).snapshot(), "boom", 4);
        let second = Uuid::new_v4();
        let resolve_id = state
            .dlq
            .enqueue(second, Workflow::new(second).snapshot(), "other", 4);

        let app = GatewayServer::build(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(Request::get("/dlq?limit=10").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/dlq/{entry_id}/requeue"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await["task_id"].as_str().unwrap(),
            task.id.to_string()
        );
        let requeued = state.store.get(task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/dlq/{resolve_id}/resolve"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"notes": "payload was malformed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Both entries handled: the unresolved list is empty.
        let response = app
            .oneshot(Request::get("/dlq").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(json_body(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_unknown_entry_is_404() {
        let app = GatewayServer::build(test_state());
        let response = app
            .oneshot(
                Request::post(format!("/dlq/{}/requeue", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
