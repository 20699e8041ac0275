// HTTP route handlers for the Assay API

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use assay_common::types::{CodeExecutionResponse, ErrorClass, ExecutionRequest, ResponseStatus};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

/// HTTP status for a response body; the body shape is the same for all of them
pub fn status_code(response: &CodeExecutionResponse) -> StatusCode {
    if response.status == ResponseStatus::Rejected {
        return StatusCode::BAD_REQUEST;
    }
    match response.error_class() {
        Some(ErrorClass::InputError) => StatusCode::BAD_REQUEST,
        Some(ErrorClass::RequestTimeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorClass::SandboxInfrastructureFailure) | Some(ErrorClass::InternalError) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Some(ErrorClass::ComparisonError) | None => StatusCode::OK,
    }
}

/// POST /execute - grade a submission and compare it against peers
pub async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    let response = match payload {
        Ok(Json(request)) => state.orchestrator.respond(request).await,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Malformed execute request");
            CodeExecutionResponse::rejected("", rejection.body_text())
        }
    };

    let code = status_code(&response);
    metrics::record_execution(&response, started.elapsed());
    if code.is_server_error() {
        error!(
            request_id = %response.request_id,
            status = %response.status,
            error = response.error.as_deref().unwrap_or_default(),
            "Execution failed"
        );
    } else {
        info!(
            request_id = %response.request_id,
            status = %response.status,
            http_status = code.as_u16(),
            "Execution request served"
        );
    }

    (code, Json(response)).into_response()
}

/// GET /languages - language discovery for submission UIs
pub async fn languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.registry().describe())
}

/// GET /health - liveness probe
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match metrics::render(state.gate.in_flight()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}
