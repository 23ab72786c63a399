//! WebSocket server + REST endpoints for tasks.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{TaskMetrics, TaskPage, TaskPatch, TaskQuery, TaskRecord, UpdateEvent};
use super::publisher::{Outbound, UpdatePublisher};
use crate::error::ClassifyError;
use crate::pipeline::queue::BatchQueue;
use crate::pipeline::types::{Classification, Classifier, ClassifyRequest};
use crate::store::TaskRepository;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn TaskRepository>,
    pub publisher: Arc<UpdatePublisher>,
    pub queue: Arc<BatchQueue>,
    pub classifier: Arc<dyn Classifier>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "Request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Build the Axum router with task WebSocket and REST routes.
pub fn task_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/bulk", patch(bulk_update))
        .route("/api/tasks/{id}", patch(update_task))
        .route("/api/classify", post(classify))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "inbox-tasks",
        "pending": state.queue.pending_len().await,
        "draining": state.queue.is_draining().await,
        "subscribers": state.publisher.subscriber_count().await,
    }))
}

async fn metrics(State(state): State<AppState>) -> ApiResult<TaskMetrics> {
    let metrics = state.repository.metrics().await.map_err(internal)?;
    Ok(Json(metrics))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.publisher))
}

async fn handle_socket(mut socket: WebSocket, publisher: Arc<UpdatePublisher>) {
    let mut sub = publisher.subscribe().await;
    info!(subscriber = %sub.id(), "WebSocket client connected");

    loop {
        tokio::select! {
            outbound = sub.recv() => {
                let frame = match outbound {
                    Some(Outbound::Event(event)) => match serde_json::to_string(&event) {
                        Ok(json) => Message::Text(json.into()),
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize update event");
                            continue;
                        }
                    },
                    Some(Outbound::Ping) => Message::Ping(Default::default()),
                    None => {
                        info!(subscriber = %sub.id(), "Subscriber dropped by heartbeat");
                        break;
                    }
                };
                if socket.send(frame).await.is_err() {
                    debug!("Client disconnected during send");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sub.ack();
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => sub.ack(),
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    publisher.unsubscribe(sub.id()).await;
    info!("WebSocket connection closed");
}

// ── REST Endpoints ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    /// Comma-separated.
    labels: Option<String>,
    start: Option<String>,
    end: Option<String>,
    search: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    // Plain dates cover the whole day in UTC.
    if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if field == "end" {
            d.and_hms_micro_opt(23, 59, 59, 999_999)
        } else {
            d.and_hms_opt(0, 0, 0)
        };
        if let Some(t) = time {
            return Ok(Some(t.and_utc()));
        }
    }
    Err(api_error(
        StatusCode::BAD_REQUEST,
        format!("Invalid {field} date: {raw}"),
    ))
}

impl ListParams {
    fn into_query(self) -> Result<TaskQuery, ApiError> {
        let defaults = TaskQuery::default();
        Ok(TaskQuery {
            labels: self
                .labels
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            start: parse_date("start", self.start.as_deref())?,
            end: parse_date("end", self.end.as_deref())?,
            search: self.search.filter(|s| !s.trim().is_empty()),
            page: self.page.unwrap_or(defaults.page).max(1),
            page_size: self.page_size.unwrap_or(defaults.page_size),
        })
    }
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<TaskPage> {
    let query = params.into_query()?;
    let page = state.repository.list(&query).await.map_err(internal)?;
    Ok(Json(page))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<TaskRecord> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid task ID"))?;

    if patch.labels.as_ref().is_some_and(|l| l.is_empty()) {
        return Err(api_error(StatusCode::BAD_REQUEST, "Labels must not be empty"));
    }

    let task = state
        .repository
        .update_by_id(id, &patch)
        .await
        .map_err(internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Task not found"))?;

    info!(task_id = %id, "Task updated");
    state
        .publisher
        .publish(UpdateEvent::TaskUpdate { task: task.clone() })
        .await;

    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkUpdateRequest {
    #[serde(default)]
    ids: Vec<Uuid>,
    is_done: Option<bool>,
    is_archived: Option<bool>,
}

async fn bulk_update(
    State(state): State<AppState>,
    Json(req): Json<BulkUpdateRequest>,
) -> ApiResult<Value> {
    if req.ids.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No task IDs provided"));
    }

    let patch = TaskPatch {
        labels: None,
        is_done: req.is_done,
        is_archived: req.is_archived,
    };
    let updated = state
        .repository
        .update_by_ids(&req.ids, &patch)
        .await
        .map_err(internal)?;
    let tasks = state
        .repository
        .find_by_ids(&req.ids)
        .await
        .map_err(internal)?;

    info!(requested = req.ids.len(), updated, "Bulk task update");
    state
        .publisher
        .publish(UpdateEvent::BulkUpdate { tasks })
        .await;

    Ok(Json(json!({ "success": true })))
}

async fn classify(
    State(state): State<AppState>,
    Json(req): Json<ClassifyRequest>,
) -> ApiResult<Classification> {
    if req.subject.trim().is_empty() || req.sender.trim().is_empty() || req.body.trim().is_empty()
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "subject, sender and body are required",
        ));
    }

    match state.classifier.classify(req).await {
        Ok(c) => Ok(Json(c)),
        Err(e @ ClassifyError::InvalidInput(_)) => {
            Err(api_error(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e @ ClassifyError::RateLimited { .. }) => {
            Err(api_error(StatusCode::TOO_MANY_REQUESTS, e.to_string()))
        }
        Err(e @ ClassifyError::Unavailable(_)) => {
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}
