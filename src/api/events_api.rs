//! 事件推送 API
//!
//! 编排器状态变更以 SSE 流推送给观察者，另提供历史补拉端点

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{
    api::response::{success_response, ApiResponse},
    app_state::AppState,
    error::AppError,
    infrastructure::event_bus::EventEnvelope,
};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/events
///
/// 订阅编排器事件流（SSE）。落后的订阅者会丢失中间事件，
/// 可用历史端点补拉。
#[utoipa::path(
    get,
    path = "/api/v1/events",
    responses(
        (status = 200, description = "Server-sent event stream of orchestrator events")
    )
)]
pub async fn subscribe_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();

    let stream = futures::stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => match Event::default().json_data(&envelope) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => {
                        tracing::warn!("Failed to serialize event: {}", e);
                        continue;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /api/v1/events/history
#[utoipa::path(
    get,
    path = "/api/v1/events/history",
    responses(
        (status = 200, description = "Recent orchestrator events, oldest first")
    )
)]
pub async fn get_event_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<EventEnvelope>>>, AppError> {
    let limit = query.limit.unwrap_or(100).min(512);
    success_response(state.events.get_event_history(limit).await)
}
