//! Quota endpoints.
//!
//! - `GET /api/v1/quota`: the caller's credits, exclusivity and block flag
//! - `PUT /api/v1/quota/{identity_key}/block`: operator block or unblock

use super::caller_identity;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub blocked: bool,
}

pub async fn get_quota(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let identity = caller_identity(&req);
    let ledger = state.orchestrator.ledger();
    ledger.reset_if_due(&identity).await?;

    let body = match ledger.snapshot(&identity).await? {
        Some(quota) => json!({
            "identity_key": quota.identity_key,
            "remaining_credits": quota.remaining_credits,
            "max_credits": ledger.policy().max_credits,
            "has_active_session": quota.has_active_session,
            "blocked": quota.blocked,
            "window_reset_at": quota.window_reset_at,
        }),
        None => json!({
            "identity_key": identity,
            "remaining_credits": ledger.policy().max_credits,
            "max_credits": ledger.policy().max_credits,
            "has_active_session": false,
            "blocked": false,
            "window_reset_at": null,
        }),
    };

    Ok(HttpResponse::Ok().json(body))
}

pub async fn set_block(
    path: web::Path<String>,
    state: web::Data<AppState>,
    body: web::Json<BlockRequest>,
) -> Result<HttpResponse, AppError> {
    let identity = path.into_inner();
    let quota = state.orchestrator.ledger().set_blocked(&identity, body.blocked).await?;
    info!(identity_key = %identity, blocked = quota.blocked, "Operator updated block flag");

    Ok(HttpResponse::Ok().json(quota))
}
