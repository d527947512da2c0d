//! `POST /api/actions/{action}`: runs a named safe action.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::extract::MaybePrincipal;
use crate::{
    errors::AppError,
    services::safe_action::{ActionError, RawInput, envelope},
    state::AppState,
};

fn status_for(err: &ActionError) -> StatusCode {
    match err {
        ActionError::Unauthorized => StatusCode::UNAUTHORIZED,
        ActionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ActionError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ActionError::Failed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ActionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The body is read raw so a malformed payload still goes through the
/// pipeline stages in order and fails validation with the decoder's
/// message, not extraction.
pub async fn run_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    MaybePrincipal(principal): MaybePrincipal,
    body: Bytes,
) -> Result<Response, AppError> {
    let input = RawInput::from_body(&body);

    let outcome = state
        .actions
        .dispatch(&action, principal.as_ref(), input)
        .await
        .ok_or_else(|| AppError::not_found(format!("Unknown action: {action}")))?;

    let status = match &outcome {
        Ok(_) => StatusCode::OK,
        Err(err) => status_for(err),
    };
    Ok((status, Json(envelope(&outcome))).into_response())
}
