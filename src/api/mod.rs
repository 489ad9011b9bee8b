//! REST API server for the deskctl daemon.
//!
//! Exposes the desktop backends to local tools (panel applets, scripts,
//! Home Assistant) over HTTP.
//!
//! # Security
//!
//! - Localhost only by default
//! - API key authentication required for all endpoints except health check
//! - CORS restricted by default
//!
//! # Usage
//!
//! ```toml
//! [api]
//! bind = "127.0.0.1:8380"
//! swagger_ui = true
//! ```
//!
//! Generate an API key:
//! ```bash
//! deskctl api-key generate
//! ```

mod auth;
mod handlers;
mod routes;
pub mod state;

pub use auth::{generate_api_key, hash_api_key};
pub use routes::create_router;
pub use state::ApiState;

use crate::config::ApiConfig;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bind the configured address.
pub async fn bind(config: &ApiConfig) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid API bind address '{}': {}", config.bind, e))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot bind API server to {}: {}", addr, e))?;
    info!("Starting REST API server on {}", addr);
    if config.swagger_ui {
        info!("Swagger UI available at http://{}/swagger-ui/", addr);
    }
    Ok(listener)
}

/// Serve on a listener from [`bind`] until `shutdown` fires.
pub async fn serve_on(
    listener: TcpListener,
    state: ApiState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state, config);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            error!("API server error: {}", e);
            anyhow::anyhow!("API server error: {}", e)
        })?;

    info!("REST API server stopped");
    Ok(())
}
