use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Everything needed to reach one broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub tls: Option<TlsConfig>,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            client_id: "mqtt-broadcaster".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            tls: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// TLS material locations. CA only gives server verification; adding both
/// client cert and key enables mutual TLS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Bounded exponential backoff for reconnect attempts.
///
/// `max_attempts: None` retries indefinitely. The delay for attempt `n`
/// (1-based) is `initial * multiplier^(n-1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent as i32);
        Duration::from_millis(raw.min(self.max_delay_ms as f64) as u64)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt > max,
            None => false,
        }
    }
}
