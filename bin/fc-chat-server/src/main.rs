//! Chat server entry point: loads configuration, builds every component via `ChatServer`, runs
//! the TLS accept loop alongside a read-only operations HTTP API, and shuts down gracefully on
//! Ctrl+C/SIGTERM.

mod api;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fc_common::logging::init_logging("fc-chat-server");

    let config = fc_config::AppConfig::load().context("failed to load configuration")?;
    info!(host = %config.server.host, port = config.server.port, "starting chat server");

    let server = fc_net::ChatServer::start(&config).await.context("failed to initialize chat server components")?;

    let api_port: u16 = std::env::var("API_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8081);
    let api_app = api::router(api::AppState { server: server.clone() }).layer(TraceLayer::new_for_http());
    let api_listener = TcpListener::bind(("0.0.0.0", api_port)).await.context("failed to bind operations API port")?;
    info!(port = api_port, "operations API listening");
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, api_app).await {
            error!(error = %e, "operations API server exited");
        }
    });

    let serve_server = server.clone();
    let serve_config = config.clone();
    let serve_task = tokio::spawn(async move {
        if let Err(e) = serve_server.serve(&serve_config).await {
            error!(error = %e, "chat server accept loop exited");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining connections");

    server.shutdown(std::time::Duration::from_secs(10)).await;
    api_task.abort();
    serve_task.abort();

    info!("chat server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
