pub mod routes;
pub mod state;

use axum::Router;
use mtbridge_core::TerminalBridge;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum application router.
pub fn build_router(bridge: Arc<dyn TerminalBridge>) -> Router {
    let app_state = Arc::new(state::AppState::new(bridge));

    Router::new()
        .nest("/api", routes::api_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Start the API server and run until `shutdown` completes.
pub async fn start_server(
    bridge: Arc<dyn TerminalBridge>,
    bind_addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(bridge);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("API server listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
