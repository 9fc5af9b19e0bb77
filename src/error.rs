//! Error types for TaskRelay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error("Web error: {0}")]
    Web(String),
}
