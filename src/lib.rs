//! # Voice Session Backend
//!
//! Lifecycle and resilience layer for realtime voice coaching sessions:
//! quota admission, a durable session registry, an orchestrator that drives
//! sessions through the external conversational engine, and a retrying
//! telemetry pipeline with a replay buffer.

pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod session;
pub mod state;
pub mod storage;
pub mod websocket;
