//! API endpoints for queue inspection and manual dequeue.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::collections::BTreeMap;

use crate::core::QueueItem;
use crate::web::AppState;

/// Every pending item in sequence order.
pub async fn list_queue(State(state): State<AppState>) -> Json<Vec<QueueItem>> {
    Json(state.dispatcher.queue().get_all().await)
}

/// Pending items grouped by target.
pub async fn list_queue_grouped(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, Vec<QueueItem>>> {
    Json(state.dispatcher.queue().get_grouped().await)
}

/// Remove a pending item.
pub async fn remove_queue_item(
    State(state): State<AppState>,
    Path(seq_id): Path<u64>,
) -> StatusCode {
    if state.dispatcher.queue().remove(seq_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
