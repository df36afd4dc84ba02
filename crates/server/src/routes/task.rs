//! Task trigger endpoint

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use agent_runner::ExecutorError;

use super::ErrorResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub task_id: Uuid,
    pub status: &'static str,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Claim a stored pending task and run its workflow in the background
async fn run_task(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Response {
    let workflow = state.workflow().clone();
    let task = match workflow.claim_task(task_id).await {
        Ok(task) => task,
        Err(e @ ExecutorError::TaskNotFound { .. }) => {
            return error(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e @ ExecutorError::InvalidState { .. }) => {
            return error(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => {
            error!("Failed to claim task {}: {}", task_id, e);
            return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    tokio::spawn(async move {
        match workflow.run_claimed(task).await {
            Ok(status) => info!("Task {} finished as {}", task_id, status.as_str()),
            Err(e) => warn!("Task {} could not be finished: {}", task_id, e),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            task_id,
            status: "accepted",
        }),
    )
        .into_response()
}

pub fn router() -> Router<AppState> {
    Router::new().route("/tasks/{id}/run", post(run_task))
}
