//! HTTP health endpoint polled by Consul.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use mesh::{MeshServer, Server};
use serde_json::json;
use tower_http::cors::CorsLayer;

/// Create the health router.
pub fn create_router(server: MeshServer) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(server)
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(server): State<MeshServer>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service_id": server.instance().id,
        "channels": server.channel_count(),
    }))
}
