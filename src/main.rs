//! # Voice Session Backend - Server Entry Point
//!
//! Wires the session subsystem together and serves it over Actix-web.
//!
//! ## Startup:
//! 1. Load `.env`, `config.toml` and `APP_*` environment overrides
//! 2. Build the quota ledger and session registry over their stores
//! 3. Build the delivery pipeline against the configured telemetry sink
//! 4. Connect the orchestrator to the realtime engine and start the drain loop
//!
//! ## Shutdown:
//! On SIGTERM/SIGINT the server stops accepting requests, every live session
//! is ended with reason `shutdown`, and the replay buffer gets one final drain.

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_session_backend::{
    config::AppConfig,
    delivery::{BufferLimits, DeliveryPipeline, EndReason, HttpTelemetrySink, MemoryTelemetrySink, RetryPolicy, TelemetrySink},
    engine::{realtime::RealtimeEngine, ConversationalEngine},
    middleware,
    orchestrator::{SessionOrchestrator, SessionSettings},
    routes,
    session::{QuotaLedger, QuotaPolicy, QuotaState, SessionRecord, SessionRegistry},
    state::AppState,
    storage::MemoryStore,
};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-session-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let orchestrator = build_orchestrator(&config)?;
    let drain_task = orchestrator
        .pipeline()
        .spawn_drain_loop(config.delivery.drain_interval());

    let app_state = AppState::new(config.clone(), orchestrator.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(routes::configure)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let ended = orchestrator.end_all(EndReason::Shutdown).await;
    info!(sessions = ended, "Live sessions ended");

    drain_task.abort();
    if let Some(report) = orchestrator.pipeline().drain().await {
        info!(
            delivered = report.delivered,
            requeued = report.requeued,
            dropped = report.dropped,
            "Final telemetry drain complete"
        );
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Build the orchestrator and everything it owns from configuration.
fn build_orchestrator(config: &AppConfig) -> Result<SessionOrchestrator> {
    let quota_store: Arc<MemoryStore<QuotaState>> = Arc::new(MemoryStore::new());
    let record_store: Arc<MemoryStore<SessionRecord>> = Arc::new(MemoryStore::new());

    let ledger = QuotaLedger::new(quota_store, QuotaPolicy::from(&config.quota));
    let registry = SessionRegistry::new(record_store);

    let sink: Arc<dyn TelemetrySink> = if config.delivery.sink_url.is_empty() {
        warn!("No telemetry sink configured, events are kept in memory");
        Arc::new(MemoryTelemetrySink::new())
    } else {
        Arc::new(HttpTelemetrySink::new(&config.delivery.sink_url)?)
    };
    let pipeline = DeliveryPipeline::with_sink(
        RetryPolicy::from(&config.delivery),
        BufferLimits::from(&config.delivery),
        sink,
    );

    let engine: Arc<dyn ConversationalEngine> = Arc::new(
        RealtimeEngine::new(config.engine.clone())?.with_event_capacity(config.session.event_channel_capacity),
    );

    Ok(SessionOrchestrator::new(
        ledger,
        registry,
        pipeline,
        engine,
        SessionSettings::from(config),
    ))
}

/// Console logging, filtered by `RUST_LOG`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
