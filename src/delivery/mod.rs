//! # Resilient Delivery
//!
//! Outbound writes (registry updates, ledger debits, telemetry) go through
//! [`DeliveryPipeline`], which retries with exponential backoff and buffers
//! whatever still fails so a later drain can redeliver it.
//!
//! ## Modules:
//! - **retry**: backoff schedule
//! - **task**: typed telemetry payloads, buffered tasks, engine-event routing
//! - **sink**: where telemetry is written
//! - **pipeline**: retry executor, buffer and drain

pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod task;

pub use pipeline::{
    is_permanent, permanent, BufferLimits, DeliveryFailure, DeliveryHealth, DeliveryOutcome, DeliveryPipeline,
    DrainReport,
};
pub use retry::RetryPolicy;
pub use sink::{HttpTelemetrySink, MemoryTelemetrySink, TelemetrySink};
pub use task::{
    route_engine_event, AudioTelemetry, DeliveryPayload, DeliveryTask, EndReason, LedgerDebitRequest, OperationKind,
    SessionEndTelemetry, SessionStartTelemetry, SessionStatusRequest,
};
