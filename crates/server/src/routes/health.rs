//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    runtime: &'static str,
    runtime_available: bool,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtime_available = state.runtime().is_available().await;
    Json(HealthResponse {
        status: if runtime_available { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        runtime: state.runtime().kind().as_str(),
        runtime_available,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
