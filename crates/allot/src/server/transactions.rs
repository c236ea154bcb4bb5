use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use bitcoin::Txid;
use serde::Serialize;

use allot_core::types::ConfirmationStatus;

use super::auth::check_auth;
use super::error::AppError;
use super::SharedState;

#[derive(Serialize)]
pub(super) struct PollResponse {
    statuses: Vec<ConfirmationStatus>,
}

pub(super) fn parse_txid(raw: &str) -> Result<Txid, AppError> {
    raw.parse()
        .map_err(|e| AppError::BadRequest(format!("invalid txid: {e}")))
}

pub(super) async fn get_tx_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(txid): Path<String>,
) -> Result<Json<ConfirmationStatus>, AppError> {
    check_auth(&state.api_token, &headers)?;
    let txid = parse_txid(&txid)?;
    Ok(Json(state.executor.get_tx_status(&txid).await?))
}

pub(super) async fn poll(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<PollResponse>, AppError> {
    check_auth(&state.api_token, &headers)?;
    let statuses = state
        .executor
        .poll_transaction_statuses()
        .await?
        .into_iter()
        .map(|(_, status)| status)
        .collect();
    Ok(Json(PollResponse { statuses }))
}
