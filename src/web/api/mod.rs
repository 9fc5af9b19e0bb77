//! API endpoints module.

pub mod executions;
pub mod queue;

pub use executions::{
    cancel_execution, create_execution, get_execution, list_executions, target_statuses,
};
pub use queue::{list_queue, list_queue_grouped, remove_queue_item};

use axum::http::StatusCode;

use crate::error::Error;

/// Map a crate error onto an HTTP status and message.
pub fn error_response(e: Error) -> (StatusCode, String) {
    let status = match &e {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("API error: {}", e);
    }
    (status, e.to_string())
}
