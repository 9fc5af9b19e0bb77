//! API endpoints for executions and target status.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;

use super::error_response;
use crate::core::{Dispatch, DispatchRequest, Execution, QueueItem, TargetStatus};
use crate::web::AppState;

/// Response when a request started immediately.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedResponse {
    pub id: String,
    pub seq_id: u64,
}

/// Response when a request was queued behind a busy target.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub queued: bool,
    pub queue_item: QueueItem,
    pub position: usize,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum DispatchResponse {
    Started(StartedResponse),
    Queued(QueuedResponse),
}

impl From<Dispatch> for DispatchResponse {
    fn from(dispatch: Dispatch) -> Self {
        match dispatch {
            Dispatch::Started { id, seq_id } => Self::Started(StartedResponse { id, seq_id }),
            Dispatch::Queued { item, position } => Self::Queued(QueuedResponse {
                queued: true,
                queue_item: item,
                position,
            }),
        }
    }
}

/// Active and recent executions.
#[derive(Serialize)]
pub struct ExecutionList {
    pub active: Vec<Execution>,
    pub recent: Vec<Execution>,
}

/// An execution with its buffered output.
#[derive(Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub output: String,
}

/// Dispatch a new request.
pub async fn create_execution(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), (StatusCode, String)> {
    let dispatch = state
        .dispatcher
        .dispatch(request)
        .await
        .map_err(error_response)?;

    let status = match dispatch {
        Dispatch::Started { .. } => StatusCode::CREATED,
        Dispatch::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(dispatch.into())))
}

/// List active and recent executions.
pub async fn list_executions(State(state): State<AppState>) -> Json<ExecutionList> {
    let manager = state.dispatcher.manager();
    Json(ExecutionList {
        active: manager.active(),
        recent: manager.recent(),
    })
}

/// Get one execution with its output.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionDetail>, StatusCode> {
    let manager = state.dispatcher.manager();
    let execution = manager.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let output = manager.output(&id).unwrap_or_default();

    Ok(Json(ExecutionDetail { execution, output }))
}

/// Cancel a running execution.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    if state.dispatcher.manager().get(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    if state.dispatcher.cancel(&id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(StatusCode::CONFLICT)
    }
}

/// Derived status for every known target.
pub async fn target_statuses(State(state): State<AppState>) -> Json<BTreeMap<String, TargetStatus>> {
    Json(state.dispatcher.target_statuses())
}
