//! Route definitions for web server.

use axum::{
    extract::State,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use super::{api, ws, AppState};

/// Largest accepted request body (prompts included).
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Create the API router.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        // Executions
        .route("/executions", get(api::list_executions).post(api::create_execution))
        .route("/executions/:id", get(api::get_execution))
        .route("/executions/:id/cancel", post(api::cancel_execution))

        // Queue
        .route("/queue", get(api::list_queue))
        .route("/queue/grouped", get(api::list_queue_grouped))
        .route("/queue/:seq_id", delete(api::remove_queue_item))

        // Targets
        .route("/targets", get(api::target_statuses))
}

/// Create the full app router.
pub fn create_app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", create_api_router())
        .route("/ws/executions/:id", get(ws::execution_socket))
        .route("/ws/events", get(ws::events_socket))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let dispatcher = &state.dispatcher;
    Json(json!({
        "status": "ok",
        "running": dispatcher.manager().active().len(),
        "queued": dispatcher.queue().len().await,
        "buffered": dispatcher.manager().buffered(),
        "subscribers": dispatcher.bus().subscriber_count(),
    }))
}
