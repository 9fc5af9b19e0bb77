//! Telegram front-end.

pub mod client;
pub mod digest;
pub mod handler;

pub use client::run_telegram_daemon;
