//! HTTP + WebSocket front end for the build service.
//!
//! | Method | Path                       | Purpose                         |
//! |--------|----------------------------|---------------------------------|
//! | POST   | `/api/builds`              | start a build (201)             |
//! | GET    | `/api/builds`              | list active builds              |
//! | GET    | `/api/builds/{id}`         | session status                  |
//! | POST   | `/api/builds/{id}/cancel`  | cancel (204, idempotent)        |
//! | GET    | `/api/builds/{id}/logs`    | WebSocket log stream            |
//! | GET    | `/health`                  | liveness                        |

pub mod api;
pub mod ws;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::service::BuildService;
use api::AppState;

pub use api::{ApiError, SharedState, StartBuildRequest, StartBuildResponse};
pub use ws::LogFrame;

/// How long shutdown waits for cancelled builds to be reaped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            dev_mode: false,
        }
    }
}

/// Build the full application router: JSON API plus the log socket.
pub fn build_router(service: BuildService) -> Router {
    let state = Arc::new(AppState { service });
    api::api_router()
        .route("/api/builds/{id}/logs", get(ws::logs_handler))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves, then cancel
/// and reap every active build.
pub async fn serve<F>(listener: TcpListener, service: BuildService, dev_mode: bool, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut app = build_router(service.clone());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    if tokio::time::timeout(SHUTDOWN_GRACE, service.registry().shutdown())
        .await
        .is_err()
    {
        tracing::warn!("builds still running after shutdown grace period");
    }
    Ok(())
}

/// Bind `config.host:config.port` and serve until Ctrl-C or SIGTERM.
pub async fn start_server(service: BuildService, config: ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("bskit server running at http://{}", local_addr);
    tracing::info!(%local_addr, dev_mode = config.dev_mode, "server started");

    serve(listener, service, config.dev_mode, shutdown_signal()).await?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, cancelling active builds");
}
