//! Web server using Axum.

use std::future::Future;
use std::net::SocketAddr;

use super::router::create_app_router;
use super::AppState;
use crate::config::WebConfig;
use crate::error::{Error, Result};

/// Web server configuration.
pub struct WebServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self::from(&WebConfig::default())
    }
}

impl From<&WebConfig> for WebServerConfig {
    fn from(config: &WebConfig) -> Self {
        Self {
            port: config.port,
            host: config.host.clone(),
        }
    }
}

/// Run the web server until `shutdown` resolves.
pub async fn run_web_server<F>(config: WebServerConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Web(format!("Invalid address: {}", e)))?;

    tracing::info!("Starting web server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Web server stopped");
    Ok(())
}
