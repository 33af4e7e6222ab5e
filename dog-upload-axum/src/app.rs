use axum::extract::DefaultBodyLimit;
use axum::Router;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::routes::upload_router;
use crate::UploadState;

/// Default request body cap: one 10MB chunk plus multipart framing
pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// The upload HTTP application: routes plus middleware, ready to serve
#[derive(Clone)]
pub struct UploadApp {
    pub state: UploadState,
    pub router: Router<()>,
}

impl UploadApp {
    pub fn new(state: UploadState) -> Self {
        Self::with_body_limit(state, DEFAULT_BODY_LIMIT)
    }

    pub fn with_body_limit(state: UploadState, max_body_bytes: usize) -> Self {
        // Layers run outermost-last: the request id is set before tracing sees the request
        let router = upload_router(state.clone())
            .layer(DefaultBodyLimit::max(max_body_bytes))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

        Self { state, router }
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
