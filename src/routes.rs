//! Route table shared by the server and the handler tests.

use crate::{handlers, health, websocket};
use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config))
            .route("/delivery/health", web::get().to(health::delivery_health))
            .route("/sessions", web::post().to(handlers::start_session))
            .route("/sessions/{id}", web::get().to(handlers::get_session))
            .route("/sessions/{id}", web::delete().to(handlers::end_session))
            .route("/sessions/{id}/events", web::post().to(handlers::relay_event))
            .route("/quota", web::get().to(handlers::get_quota))
            .route("/quota/{identity_key}/block", web::put().to(handlers::set_block)),
    )
    .route("/ws/sessions/{id}", web::get().to(websocket::session_socket))
    // Root-level health check for load balancers
    .route("/health", web::get().to(health::health_check));
}
