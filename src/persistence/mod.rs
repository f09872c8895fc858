//! # Persistence Module
//!
//! ## Why This Module Exists
//! Holds the application configuration model and its on-disk lifecycle:
//! broker settings, reconnect policy, broadcast defaults, scanner settings,
//! saved subscriptions and the statistics file location all survive restarts
//! here. Channel statistics themselves live in their own JSON file (see
//! `stats::store`); this module schedules their autosave.
//!
//! ## Error Handling Strategy
//! Follows a fail-safe approach: a missing configuration file is created
//! with defaults, a corrupt one degrades to defaults with a logged warning.
//! The application never refuses to start over bad configuration.

pub mod config_store;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerConfig;
use crate::scanner::ScanConfig;

/// Defaults applied to broadcast jobs started without explicit overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastDefaults {
    /// Channel used when no explicit target list is given.
    pub topic: String,
    pub count: u64,
    pub interval_ms: u64,
    pub workers: usize,
    pub qos: u8,
    pub retain: bool,
    pub append_counter: bool,
}

impl Default for BroadcastDefaults {
    fn default() -> Self {
        Self {
            topic: "test/topic".to_string(),
            count: 10,
            interval_ms: 100,
            workers: 1,
            qos: 0,
            retain: false,
            append_counter: false,
        }
    }
}

/// Complete application configuration, one TOML file on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Topic filters re-subscribed after every successful connect.
    pub subscriptions: Vec<String>,
    pub history_cap: usize,
    pub refresh_interval_ms: u64,
    pub stats_file: PathBuf,
    pub stats_autosave_secs: u64,
    /// How recently a channel must have been active to count as online.
    pub freshness_window_secs: u64,
    pub broker: BrokerConfig,
    pub broadcast: BroadcastDefaults,
    pub scanner: ScanConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
            history_cap: 1_000,
            refresh_interval_ms: 250,
            stats_file: config_store::default_config_dir().join("channel_stats.json"),
            stats_autosave_secs: 300,
            freshness_window_secs: 60,
            broker: BrokerConfig::default(),
            broadcast: BroadcastDefaults::default(),
            scanner: ScanConfig::default(),
        }
    }
}
