//! HTTP routes

pub mod containers;
pub mod health;
pub mod task;

use axum::Router;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(task::router())
        .merge(containers::router())
}
