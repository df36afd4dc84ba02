//! Managed-container maintenance

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Serialize;
use tracing::error;

use super::ErrorResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

async fn cleanup_containers(
    State(state): State<AppState>,
) -> Result<Json<CleanupResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.monitor().cleanup_orphaned_containers().await {
        Ok(removed) => Ok(Json(CleanupResponse { removed })),
        Err(e) => {
            error!("Container cleanup failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/containers/cleanup", post(cleanup_containers))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use container_runtime::ContainerStatus;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::routes::test_support::{build_state, ListRuntime};

    #[tokio::test]
    async fn cleanup_removes_stopped_containers() {
        let runtime = Arc::new(
            ListRuntime::new(true)
                .with("stopped", ContainerStatus::Exited)
                .with("busy", ContainerStatus::Running),
        );
        let (state, _store, _tmp) = build_state(runtime.clone()).await;

        let response = router()
            .with_state(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/containers/cleanup")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["removed"], 1);

        let left = runtime.containers.lock().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "busy");
    }
}
