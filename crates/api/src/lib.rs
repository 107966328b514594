//! `api` crate: HTTP surface over the engine supervisor.
//!
//! Exposes:
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows
//!   GET    /api/v1/workflows/:id
//!   POST   /api/v1/workflows/:id/execute   (server-sent events)
//!   POST   /api/v1/workflows/:id/cancel
//!   GET    /api/v1/metrics

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use engine::EngineSupervisor;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: EngineSupervisor,
}

pub fn router(supervisor: EngineSupervisor) -> Router {
    Router::new()
        .route(
            "/api/v1/workflows",
            get(handlers::workflows::list).post(handlers::workflows::create),
        )
        .route("/api/v1/workflows/:id", get(handlers::workflows::get))
        .route(
            "/api/v1/workflows/:id/execute",
            post(handlers::executions::execute),
        )
        .route(
            "/api/v1/workflows/:id/cancel",
            post(handlers::executions::cancel),
        )
        .route("/api/v1/metrics", get(handlers::metrics::get))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { supervisor })
}

/// Bind `bind` and serve until the process exits.
pub async fn serve(bind: &str, supervisor: EngineSupervisor) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, router(supervisor)).await
}
