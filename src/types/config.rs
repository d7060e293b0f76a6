//! Configuration structures.
//!
//! Configuration is loaded from JSON documents and environment variables.

use crate::types::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Event loop and worker pool configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Event bus configuration.
    #[serde(default)]
    pub event_bus: EventBusConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a configuration document. Missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `COURIER_*` environment overrides on top of this configuration.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(size) = env_usize("COURIER_EVENT_LOOP_POOL_SIZE") {
            self.runtime.event_loop_pool_size = size;
        }
        if let Some(size) = env_usize("COURIER_WORKER_POOL_SIZE") {
            self.runtime.worker_pool_size = size;
        }
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not a positive integer", key, raw);
            None
        }
    }
}

/// Event loop and worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of event-loop threads.
    pub event_loop_pool_size: usize,

    /// Maximum number of blocking worker threads.
    pub worker_pool_size: usize,

    /// How often the blocked-thread checker samples. Zero disables it.
    #[serde(with = "humantime_serde")]
    pub blocked_thread_check_interval: Duration,

    /// Event-loop task duration after which a blocked-thread warning is logged.
    #[serde(with = "humantime_serde")]
    pub max_event_loop_execute_time: Duration,

    /// Worker task duration after which a blocked-thread warning is logged.
    #[serde(with = "humantime_serde")]
    pub max_worker_execute_time: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            event_loop_pool_size: 2 * cpus,
            worker_pool_size: 20,
            blocked_thread_check_interval: Duration::from_secs(1),
            max_event_loop_execute_time: Duration::from_secs(2),
            max_worker_execute_time: Duration::from_secs(60),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Reply timeout applied when delivery options do not set one.
    #[serde(with = "humantime_serde")]
    pub default_send_timeout: Duration,

    /// Buffer cap for paused consumers.
    pub max_buffered_messages: usize,

    /// Initial credits (and write queue size) of a message producer.
    pub producer_max_credits: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            default_send_timeout: Duration::from_secs(30),
            max_buffered_messages: 1000,
            producer_max_credits: 1000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
