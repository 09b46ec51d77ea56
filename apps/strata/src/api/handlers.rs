//! # API Endpoint Handlers

use super::{
    WorkerState,
    types::{HealthResponse, StatusResponse},
};
use crate::fanout::{FanOutPayload, Fault, InvocationError, handle_payload};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Served tasks and graph size.
pub async fn status_handler(State(state): State<WorkerState>) -> Response {
    let graph = &state.graph;
    match graph
        .vertex_count()
        .and_then(|vertices| graph.edge_count().map(|edges| (vertices, edges)))
    {
        Ok((vertex_count, edge_count)) => (
            StatusCode::OK,
            Json(StatusResponse {
                tasks: state.tasks.names(),
                vertex_count,
                edge_count,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "status unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(InvocationError::from(e)),
            )
                .into_response()
        }
    }
}

/// Execute one fan-out payload.
///
/// Caller faults answer 422 and transient faults 503, both with an
/// `{errorType, errorMessage}` body.
pub async fn invoke_handler(
    State(state): State<WorkerState>,
    Json(payload): Json<FanOutPayload>,
) -> Response {
    let task = payload.task_name.clone();
    match handle_payload(&state.tasks, state.children.clone(), payload).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(error) => {
            let status = match error.fault() {
                Fault::Caller => StatusCode::UNPROCESSABLE_ENTITY,
                Fault::Transient => StatusCode::SERVICE_UNAVAILABLE,
            };
            tracing::warn!(task = %task, error = %error, "invocation failed");
            (status, Json(error)).into_response()
        }
    }
}
