/// HTTP API server.
///
/// The server is a thin routing layer over [`ProofService`]. It adds no
/// behaviour of its own beyond request decoding, error mapping, CORS,
/// compression and request tracing.
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::service::ProofService;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProofService>,
}

/// Build the Axum application with all routes and middleware.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::service_routes())
        .merge(routes::proof_routes())
        .with_state(Arc::new(state))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the API server.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("proof-anchor API server listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
