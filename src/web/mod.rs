//! Web server module (Axum REST API + websocket re-broadcaster).

pub mod api;
pub mod router;
pub mod server;
pub mod ws;

use std::sync::Arc;

use crate::core::Dispatcher;

pub use server::{run_web_server, WebServerConfig};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}
