use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use allot_core::types::{ConsistencyReport, ValidationReport};
use allot_core::UserId;

use super::auth::check_auth;
use super::error::AppError;
use super::transactions::parse_txid;
use super::SharedState;

// ==============================================================================
// DTOs
// ==============================================================================

#[derive(Deserialize)]
pub(super) struct ValidateQuery {
    txid: String,
    expected_positions: usize,
}

#[derive(Serialize)]
pub(super) struct AddressResponse {
    user: String,
    address: String,
}

// ==============================================================================
// Handlers
// ==============================================================================

pub(super) async fn consistency(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user): Path<String>,
) -> Result<Json<ConsistencyReport>, AppError> {
    check_auth(&state.api_token, &headers)?;
    let report = state
        .executor
        .check_portfolio_state_consistency(&UserId::from(user))
        .await?;
    Ok(Json(report))
}

pub(super) async fn validate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user): Path<String>,
    Query(query): Query<ValidateQuery>,
) -> Result<Json<ValidationReport>, AppError> {
    check_auth(&state.api_token, &headers)?;
    let txid = parse_txid(&query.txid)?;
    let report = state
        .executor
        .validate_post_execution_state(&UserId::from(user), &txid, query.expected_positions)
        .await?;
    Ok(Json(report))
}

pub(super) async fn deposit_address(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user): Path<String>,
) -> Result<Json<AddressResponse>, AppError> {
    check_auth(&state.api_token, &headers)?;
    let address = state
        .executor
        .deposit_address(&UserId::from(user.clone()))
        .await?;
    Ok(Json(AddressResponse {
        user,
        address: address.to_string(),
    }))
}

pub(super) async fn rotate_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user): Path<String>,
) -> Result<Json<AddressResponse>, AppError> {
    check_auth(&state.api_token, &headers)?;
    let address = state
        .executor
        .rotate_key(&UserId::from(user.clone()))
        .await?;
    tracing::info!(%user, %address, "rotated signing key");
    Ok(Json(AddressResponse {
        user,
        address: address.to_string(),
    }))
}
