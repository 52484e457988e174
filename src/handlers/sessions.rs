//! Session lifecycle endpoints.
//!
//! - `POST /api/v1/sessions`: admit and provision a session for the caller
//! - `GET /api/v1/sessions/{id}`: durable record plus client-visible phase
//! - `DELETE /api/v1/sessions/{id}?reason=`: end a session
//! - `POST /api/v1/sessions/{id}/events`: relay one engine event from the client transport

use super::caller_identity;
use crate::delivery::EndReason;
use crate::engine::EngineEvent;
use crate::error::AppError;
use crate::session::SessionMetadata;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    /// Opaque caller context (member profile, goals) passed through to the record
    #[serde(default)]
    pub metadata: SessionMetadata,
}

#[derive(Debug, Deserialize)]
pub struct EndSessionQuery {
    pub reason: Option<String>,
}

pub async fn start_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: Option<web::Json<StartSessionRequest>>,
) -> Result<HttpResponse, AppError> {
    let identity = caller_identity(&req);
    let request = body.map(web::Json::into_inner).unwrap_or_default();

    let started = state.orchestrator.start(&identity, request.metadata).await?;
    info!(durable_id = %started.durable_id, identity_key = %identity, "Session started via API");

    Ok(HttpResponse::Created().json(started))
}

pub async fn get_session(path: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let durable_id = path.into_inner();
    let record = state
        .orchestrator
        .registry()
        .get(&durable_id)
        .await
        .map_err(|e| AppError::ServiceUnavailable(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("session {}", durable_id)))?;
    let phase = state.orchestrator.phase(&durable_id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "session": record,
        "phase": phase,
    })))
}

pub async fn end_session(
    path: web::Path<String>,
    query: web::Query<EndSessionQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let durable_id = path.into_inner();
    let reason = match query.reason.as_deref() {
        Some(raw) => raw.parse::<EndReason>().map_err(AppError::ValidationError)?,
        None => EndReason::UserCancelled,
    };

    let outcome = state.orchestrator.end(&durable_id, reason).await?;
    Ok(HttpResponse::Ok().json(json!({
        "durable_id": durable_id,
        "reason": reason,
        "result": outcome,
    })))
}

pub async fn relay_event(
    path: web::Path<String>,
    state: web::Data<AppState>,
    event: web::Json<EngineEvent>,
) -> Result<HttpResponse, AppError> {
    let durable_id = path.into_inner();
    state.orchestrator.on_external_event(&durable_id, event.into_inner())?;
    Ok(HttpResponse::Accepted().finish())
}
