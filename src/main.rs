mod config;
mod message;
mod routes;
mod services;
mod state;

use tracing_subscriber::EnvFilter;

use crate::config::HubConfig;
use crate::services::connection::{self, CloseReason};
use crate::services::router::spawn_expiry_task;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HubConfig::from_env();
    let port = config.port;
    tracing::info!(
        port,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        typing_ttl_ms = u64::try_from(config.typing_ttl.as_millis()).unwrap_or(u64::MAX),
        cursor_ttl_ms = u64::try_from(config.cursor_ttl.as_millis()).unwrap_or(u64::MAX),
        auto_join = ?config.auto_join_rooms,
        "hub config loaded"
    );

    let state = state::AppState::new(config);
    let expiry = spawn_expiry_task(state.router.clone());

    let app = routes::app(state.clone());
    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%port, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(%port, "taskhub listening");
    let shutdown_state = state.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
            connection::close_all(&shutdown_state, CloseReason::ServerShutdown);
        })
        .await;

    expiry.abort();
    if let Err(e) = served {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
    tracing::info!("taskhub stopped");
}
