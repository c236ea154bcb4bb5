mod auth;
mod error;
mod plans;
mod transactions;
mod users;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::HeaderMap;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

use allot_core::types::AuditEntry;
use allot_core::Executor;

use auth::check_auth;

// ==============================================================================
// Application State
// ==============================================================================

pub struct AppState {
    pub executor: Arc<Executor>,
    pub api_token: String,
}

type SharedState = Arc<AppState>;

// ==============================================================================
// Router
// ==============================================================================

/// Request bodies are tiny (`{"caller": ...}`).
const BODY_LIMIT: usize = 16 * 1024;

pub fn build_router(state: AppState, origin: &str) -> Router {
    // Reflect the origin only on an exact match so browsers get a clean
    // CORS rejection otherwise.
    let allowed = origin.to_owned();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |request_origin: &axum::http::HeaderValue, _| {
                request_origin.as_bytes() == allowed.as_bytes()
            },
        ))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::HeaderName::from_static(auth::API_TOKEN_HEADER),
        ]);

    let shared = Arc::new(state);

    let public_api = Router::new().route("/api/v1/health", get(health));

    let protected_api = Router::new()
        .route("/api/v1/plans/{plan_id}/execute", post(plans::execute_plan))
        .route("/api/v1/plans/{plan_id}/cancel", post(plans::cancel_execution))
        .route("/api/v1/tx/{txid}", get(transactions::get_tx_status))
        .route("/api/v1/poll", post(transactions::poll))
        .route("/api/v1/users/{user}/consistency", get(users::consistency))
        .route("/api/v1/users/{user}/validate", get(users::validate))
        .route(
            "/api/v1/users/{user}/deposit-address",
            get(users::deposit_address),
        )
        .route("/api/v1/users/{user}/rotate-key", post(users::rotate_key))
        .route("/api/v1/audit", get(audit_log))
        .layer(DefaultBodyLimit::max(BODY_LIMIT));

    Router::new()
        .merge(public_api)
        .merge(protected_api)
        .route("/api", any(api_not_found))
        .route("/api/{*path}", any(api_not_found))
        .layer(cors)
        .with_state(shared)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct AuditResponse {
    entries: Vec<AuditEntry>,
}

async fn audit_log(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<AuditResponse>, error::AppError> {
    check_auth(&state.api_token, &headers)?;
    Ok(Json(AuditResponse {
        entries: state.executor.audit_log().await,
    }))
}

async fn api_not_found() -> error::AppError {
    error::AppError::NotFound("API route not found".to_string())
}
