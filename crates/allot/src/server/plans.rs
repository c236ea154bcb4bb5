use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use allot_core::{PlanId, UserId};

use super::auth::check_auth;
use super::error::AppError;
use super::SharedState;

// ==============================================================================
// DTOs
// ==============================================================================

#[derive(Deserialize)]
pub(super) struct ExecuteRequest {
    caller: String,
}

#[derive(Serialize)]
pub(super) struct ExecuteResponse {
    plan_id: String,
    txids: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct CancelResponse {
    plan_id: String,
    cancelled: bool,
}

// ==============================================================================
// Handlers
// ==============================================================================

pub(super) async fn execute_plan(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, AppError> {
    check_auth(&state.api_token, &headers)?;
    if request.caller.trim().is_empty() {
        return Err(AppError::BadRequest("caller must not be empty".to_string()));
    }

    let txids = state
        .executor
        .execute_plan(&UserId::from(request.caller), &PlanId::from(plan_id.clone()))
        .await?;

    Ok(Json(ExecuteResponse {
        plan_id,
        txids: txids.iter().map(ToString::to_string).collect(),
    }))
}

pub(super) async fn cancel_execution(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    check_auth(&state.api_token, &headers)?;

    let cancelled = state
        .executor
        .cancel_execution(&PlanId::from(plan_id.clone()))
        .await?;

    Ok(Json(CancelResponse { plan_id, cancelled }))
}
