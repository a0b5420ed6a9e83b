//! Mining handlers: create, get, delete, stream.

use super::{CreateMiningRequest, DataResponse, DeletedTask};
use crate::api::AppState;
use crate::error::Result;
use crate::miner::{StreamGuard, TaskStream};
use crate::types::{MiningTask, TaskEvent, TaskId};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// POST /mine - Start mining a mailbox
#[utoipa::path(
    post,
    path = "/mine",
    tag = "mining",
    request_body = CreateMiningRequest,
    responses(
        (status = 201, description = "Task created; credentials were accepted", body = MiningTask),
        (status = 400, description = "Malformed request", body = crate::error::ApiError),
        (status = 401, description = "Mailbox credentials rejected", body = crate::error::ApiError),
        (status = 503, description = "Shutting down", body = crate::error::ApiError)
    )
)]
pub async fn create_mining_task(
    State(state): State<AppState>,
    Json(request): Json<CreateMiningRequest>,
) -> Result<impl IntoResponse> {
    let (user_id, options) = request.into_parts();
    let task = state.miner.create_task(&user_id, options).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: task })))
}

/// GET /mine/:id - Current task snapshot
#[utoipa::path(
    get,
    path = "/mine/{id}",
    tag = "mining",
    params(
        ("id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task snapshot", body = MiningTask),
        (status = 404, description = "Unknown or reaped task", body = crate::error::ApiError)
    )
)]
pub async fn get_mining_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let task = state.miner.get_active_task(&TaskId::from(id)).await?;
    Ok(Json(DataResponse { data: task }))
}

/// DELETE /mine/:id - Cancel a task
///
/// Idempotent: unknown ids answer the same as live ones.
#[utoipa::path(
    delete,
    path = "/mine/{id}",
    tag = "mining",
    params(
        ("id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task deleted", body = DeletedTask)
    )
)]
pub async fn delete_mining_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = TaskId::from(id);
    let removed = state.miner.delete_task(&id).await;
    tracing::debug!(task_id = %id, removed, "Delete requested");
    Json(DataResponse {
        data: DeletedTask { id, deleted: true },
    })
}

/// GET /stream/:id - Server-sent events for one task
///
/// Opens with a `snapshot` event, then `progress` events, and ends with
/// `close`. The task is deleted when the client disconnects.
#[utoipa::path(
    get,
    path = "/stream/{id}",
    tag = "mining",
    params(
        ("id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Server-sent events stream (text/event-stream)", content_type = "text/event-stream"),
        (status = 404, description = "Unknown or reaped task", body = crate::error::ApiError)
    )
)]
pub async fn stream_mining_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<BoxStream<'static, std::result::Result<SseEvent, Infallible>>>> {
    let TaskStream {
        snapshot,
        events,
        guard,
    } = state.miner.attach_stream(&TaskId::from(id)).await?;

    let mut opening: Vec<SseEvent> = to_sse("snapshot", &snapshot).into_iter().collect();
    let events = if snapshot.status.is_terminal() {
        // finished tasks stay readable until reaped
        guard.disarm();
        // the close event was sent before we subscribed
        let close = TaskEvent::Close {
            id: snapshot.id.clone(),
            status: snapshot.status,
            progress: snapshot.progress,
            error: snapshot.error.clone(),
        };
        opening.extend(to_sse(close.name(), &close));
        stream::iter(opening).map(Ok::<_, Infallible>).boxed()
    } else {
        let live = LiveStream {
            events: BroadcastStream::new(events),
            _guard: guard,
        };
        stream::iter(opening)
            .chain(stream::unfold(Some(live), next_live_event))
            .map(Ok::<_, Infallible>)
            .boxed()
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Receiver half of a task stream; dropping it deletes the task
struct LiveStream {
    events: BroadcastStream<TaskEvent>,
    _guard: StreamGuard,
}

async fn next_live_event(live: Option<LiveStream>) -> Option<(SseEvent, Option<LiveStream>)> {
    let mut live = live?;
    loop {
        match live.events.next().await? {
            Ok(event) => {
                let closed = matches!(event, TaskEvent::Close { .. });
                let Some(sse) = to_sse(event.name(), &event) else {
                    continue;
                };
                return Some((sse, if closed { None } else { Some(live) }));
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!("SSE client lagged, skipped {} events", skipped);
                let sse = SseEvent::default()
                    .event("error")
                    .data(format!(r#"{{"error":"lagged","skipped":{}}}"#, skipped));
                return Some((sse, Some(live)));
            }
        }
    }
}

fn to_sse<T: serde::Serialize>(name: &str, payload: &T) -> Option<SseEvent> {
    match serde_json::to_string(payload) {
        Ok(json_data) => Some(SseEvent::default().event(name).data(json_data)),
        Err(e) => {
            tracing::warn!("Failed to serialize event to JSON: {}", e);
            None
        }
    }
}
