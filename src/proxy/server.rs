//! Proxy server setup and initialization

use anyhow::{Context, Result};
use axum::{
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;

use super::{admin, handler, stats, ws};
use super::state::ProxyState;

/// Build the router: tenant surface, admin surface, event channel, and the
/// catch-all proxy handler.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        // Tenant-facing endpoints
        .route("/health", get(stats::health))
        .route("/stats", get(stats::tenant_stats))
        // Dashboard event channel
        .route("/ws", get(ws::ws_handler))
        // Admin surface
        .route(
            "/api/keys",
            get(admin::list_keys).post(admin::create_key),
        )
        .route(
            "/api/keys/:id",
            get(admin::get_key)
                .put(admin::update_key)
                .delete(admin::delete_key),
        )
        .route("/api/keys/:id/usage", get(admin::key_usage))
        .route("/api/metrics", get(admin::metrics))
        // Proxy handler (catch-all)
        .route("/*path", any(handler::proxy_handler))
        .with_state(state)
}

/// Start the proxy server
pub async fn start_server(
    state: ProxyState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = state.config.bind_addr;
    let app = build_router(state);

    tracing::info!("Starting proxy on {}", bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Proxy listening on {}", bind_addr);

    // Start serving requests with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}
