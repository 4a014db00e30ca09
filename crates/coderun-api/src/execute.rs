//! Synchronous transport: one JSON request in, one JSON result out.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use coderun_core::{AccumulatingSink, CancellationToken, ExecutionRequest, ExecutionStatus};

use crate::error::ServerError;
use crate::AppState;

/// Handler for `POST /v1/execute`.
///
/// A program that ran and failed still answers 200 with `status: "error"`;
/// a session that hit its deadline answers 408 with whatever output was
/// captured before it.
pub async fn execute_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            log::warn!("Rejected execute payload: {}", rejection.body_text());
            return ServerError::invalid_request(rejection.body_text()).into_response();
        }
    };

    let limit = state.orchestrator.execution_config().max_output_bytes;
    let mut sink = AccumulatingSink::new(limit);
    // Nothing cancels a synchronous session except the handler future being
    // dropped, which the container guard covers.
    let report = state
        .orchestrator
        .execute(request, &mut sink, CancellationToken::new())
        .await;

    match report.into_result() {
        Ok(result) => {
            let status = match result.status {
                ExecutionStatus::Timeout => StatusCode::REQUEST_TIMEOUT,
                ExecutionStatus::Success | ExecutionStatus::Error => StatusCode::OK,
            };
            (status, Json(result)).into_response()
        }
        Err(e) => ServerError::from(e).into_response(),
    }
}
