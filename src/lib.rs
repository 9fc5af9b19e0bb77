//! TaskRelay library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod runner;
pub mod telegram;
pub mod web;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{
    CommandQueue, Dispatch, DispatchRequest, Dispatcher, EventBus, Execution, ExecutionEvent,
    ExecutionManager, OutputBuffer,
};
pub use error::{Error, Result};
pub use runner::{ClaudeRunner, CliRunner};
pub use telegram::run_telegram_daemon;
pub use web::run_web_server;
