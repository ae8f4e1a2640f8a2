//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};

use crate::health::HealthSnapshot;
use crate::service::RouterService;

async fn health_check(State(service): State<Arc<RouterService>>) -> Json<HealthSnapshot> {
    Json(service.health().await)
}

async fn shutdown(State(service): State<Arc<RouterService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<RouterService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
