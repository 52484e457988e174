//! # Configuration Management
//!
//! Loads the service configuration from three layers, highest priority first:
//! 1. Environment variables (`APP_` prefix, `__` between section and field,
//!    e.g. `APP_QUOTA__MAX_CREDITS=20`)
//! 2. Configuration file (`config.toml`, optional)
//! 3. Built-in defaults (the `Default` impl below)
//!
//! `HOST` and `PORT` are honoured as well, since most deployment platforms set them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Top-level configuration, one struct per concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub quota: QuotaConfig,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub engine: EngineConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-identity credit allowance.
///
/// ## Fields:
/// - `max_credits`: credits restored at every window reset
/// - `window_secs`: length of one quota window
/// - `unit_seconds`: wall-clock seconds that consume one credit (rounded up)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub max_credits: u32,
    pub window_secs: u64,
    pub unit_seconds: u64,
}

/// Realtime session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard deadline after which a session is ended with reason `timeout`
    pub max_duration_secs: u64,

    /// Upper bound on the ephemeral credential round-trip
    pub credential_timeout_ms: u64,

    /// Capacity of the per-session engine event channel
    pub event_channel_capacity: usize,
}

/// Retry, backoff and buffering for outbound telemetry and accounting writes.
///
/// ## Backoff:
/// Delay before retry `n` (n >= 1) is `min(base_delay_ms * multiplier^(n-1), max_delay_ms)`.
///
/// ## Buffer:
/// Tasks that exhaust `max_retries` are buffered and redelivered by the drain cycle
/// until they succeed or exceed `max_task_attempts`. At most `max_buffer_size`
/// tasks are held; the oldest is evicted (and counted as dropped) on overflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub max_task_attempts: u32,
    pub max_buffer_size: usize,
    pub drain_interval_ms: u64,

    /// Base URL of the telemetry store. Empty keeps telemetry in memory.
    pub sink_url: String,
}

/// External conversational engine endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub realtime_ws_url: String,

    /// Secret used to request ephemeral credentials. Never echoed by the API.
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            quota: QuotaConfig {
                max_credits: 10,       // ten minutes per window
                window_secs: 86_400,   // daily reset
                unit_seconds: 60,
            },
            session: SessionConfig {
                max_duration_secs: 600,
                credential_timeout_ms: 10_000,
                event_channel_capacity: 256,
            },
            delivery: DeliveryConfig {
                base_delay_ms: 1_000,
                multiplier: 2.0,
                max_delay_ms: 10_000,
                max_retries: 3,
                max_task_attempts: 5,
                max_buffer_size: 1_000,
                drain_interval_ms: 30_000,
                sink_url: String::new(),
            },
            engine: EngineConfig {
                api_base_url: "https://api.openai.com/v1".to_string(),
                realtime_ws_url: "wss://api.openai.com/v1/realtime".to_string(),
                api_key: String::new(),
                model: "gpt-4o-realtime-preview".to_string(),
                voice: "alloy".to_string(),
                instructions: "You are a friendly fitness coach assisting a gym member.".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.quota.max_credits == 0 {
            return Err(anyhow::anyhow!("Quota max_credits must be greater than 0"));
        }
        if self.quota.window_secs == 0 {
            return Err(anyhow::anyhow!("Quota window_secs must be greater than 0"));
        }
        if self.quota.unit_seconds == 0 {
            return Err(anyhow::anyhow!("Quota unit_seconds must be greater than 0"));
        }

        if self.session.max_duration_secs == 0 {
            return Err(anyhow::anyhow!("Session max_duration_secs must be greater than 0"));
        }
        if self.session.event_channel_capacity == 0 {
            return Err(anyhow::anyhow!("Session event_channel_capacity must be greater than 0"));
        }

        if self.delivery.multiplier < 1.0 {
            return Err(anyhow::anyhow!("Delivery multiplier must be at least 1.0"));
        }
        if self.delivery.base_delay_ms > self.delivery.max_delay_ms {
            return Err(anyhow::anyhow!("Delivery base_delay_ms cannot exceed max_delay_ms"));
        }
        if self.delivery.max_task_attempts == 0 {
            return Err(anyhow::anyhow!("Delivery max_task_attempts must be greater than 0"));
        }
        if self.delivery.max_buffer_size == 0 {
            return Err(anyhow::anyhow!("Delivery max_buffer_size must be greater than 0"));
        }

        Ok(())
    }

    /// The configuration as JSON with secrets redacted, for the config endpoint.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(engine) = value.get_mut("engine").and_then(|e| e.as_object_mut()) {
            let shown = if self.engine.api_key.is_empty() { "" } else { "***" };
            engine.insert("api_key".to_string(), serde_json::Value::from(shown));
        }
        value
    }
}

impl SessionConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }
}

impl DeliveryConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}
