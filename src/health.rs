//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus a summary of sessions and delivery
//! - `GET /api/v1/metrics`: per-endpoint request statistics
//! - `GET /api/v1/delivery/health`: the delivery pipeline snapshot on its own
//!
//! The service reports `degraded` while telemetry is being buffered or dropped,
//! since that means the telemetry store is failing.

use crate::delivery::DeliveryHealth;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// Buffer fill ratio above which the service reports a load warning.
const BUFFER_WARNING_RATIO: f64 = 0.8;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let delivery = state.orchestrator.pipeline().health();

    HttpResponse::Ok().json(json!({
        "status": service_status(&delivery),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "live_sessions": state.live_sessions()
        },
        "delivery": delivery,
        "memory": get_memory_info(),
        "system": get_system_status(config.delivery.max_buffer_size, &delivery)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "live_sessions": state.live_sessions(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "delivery": state.orchestrator.pipeline().health(),
        "memory": get_memory_info()
    }))
}

pub async fn delivery_health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.orchestrator.pipeline().health())
}

fn service_status(delivery: &DeliveryHealth) -> &'static str {
    if delivery.queue_size > 0 || delivery.dropped > 0 {
        "degraded"
    } else {
        "healthy"
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "pid": process::id(),
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(max_buffer_size: usize, delivery: &DeliveryHealth) -> serde_json::Value {
    let buffer_usage = if max_buffer_size > 0 {
        delivery.queue_size as f64 / max_buffer_size as f64
    } else {
        0.0
    };

    let mut warnings = Vec::new();
    if buffer_usage > BUFFER_WARNING_RATIO {
        warnings.push("Delivery buffer nearly full; oldest telemetry will be evicted");
    }
    if delivery.dropped > 0 {
        warnings.push("Telemetry has been dropped; check the telemetry store");
    }

    json!({
        "buffer_usage_percent": (buffer_usage * 100.0).round(),
        "max_buffer_size": max_buffer_size,
        "delivery_error_rate": delivery.error_rate,
        "load_warnings": warnings
    })
}
