use axum::{Router, http::Method, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    config::RelayConfig,
    handler::ytmp3::{AppState, ytmp3_router},
};

pub(crate) fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .nest("/ytmp3", ytmp3_router(state))
        .layer(cors)
}

pub(crate) fn start_api_server(
    config: &RelayConfig,
    state: AppState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let addr = format!("0.0.0.0:{}", config.port);
    tokio::spawn(async move {
        let app = app_router(state);

        let listener = TcpListener::bind(&addr).await.inspect_err(|e| {
            log::error!("Error binding API server to {}: {}", addr, e);
            cancel.cancel();
        })?;
        log::info!("API server started on {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
            .inspect_err(|e| log::error!("Error running API server: {}", e))?;
        Ok(())
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "✅ YT→MP3 API is running."
}
