use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("failed to write statistics file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize statistics: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Cumulative counters for a single channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ChannelStats {
    /// A channel is online iff its last activity is within `window` of `now`.
    pub fn online_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        match self.last_seen {
            Some(seen) => now.signed_duration_since(seen) <= window,
            None => false,
        }
    }
}

/// Shared per-channel counter store.
///
/// Channels are created on first reference and only removed by `reset_all`.
/// Counters never decrease except on explicit reset.
#[derive(Debug)]
pub struct StatsStore {
    channels: Mutex<HashMap<String, ChannelStats>>,
    freshness_window: Duration,
}

impl StatsStore {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            freshness_window,
        }
    }

    /// Loads counters from `path`. A missing or unreadable file yields an
    /// empty store; startup must not fail on bad statistics.
    pub fn load(path: &Path, freshness_window: Duration) -> Self {
        let channels = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, ChannelStats>>(&content) {
                Ok(map) => {
                    info!("loaded statistics for {} channels", map.len());
                    map
                }
                Err(e) => {
                    warn!("statistics file {} is corrupt, starting empty: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) => {
                info!("no statistics file at {}, starting empty: {}", path.display(), e);
                HashMap::new()
            }
        };

        Self {
            channels: Mutex::new(channels),
            freshness_window,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StatsError> {
        let snapshot = self.snapshot();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, content)?;
        debug!("saved statistics for {} channels to {}", snapshot.len(), path.display());
        Ok(())
    }

    pub fn record_sent(&self, channel: &str) {
        let mut map = self.lock();
        let entry = map.entry(channel.to_string()).or_default();
        entry.sent += 1;
        entry.last_seen = Some(Utc::now());
    }

    pub fn record_received(&self, channel: &str) {
        let mut map = self.lock();
        let entry = map.entry(channel.to_string()).or_default();
        entry.received += 1;
        entry.last_seen = Some(Utc::now());
    }

    pub fn snapshot(&self) -> HashMap<String, ChannelStats> {
        self.lock().clone()
    }

    /// Names of every channel seen so far, for "broadcast to all" targets.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_online(&self, channel: &str, now: DateTime<Utc>) -> bool {
        self.lock()
            .get(channel)
            .map(|stats| stats.online_at(now, self.freshness_window))
            .unwrap_or(false)
    }

    pub fn reset_all(&self) {
        self.lock().clear();
        info!("channel statistics reset");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChannelStats>> {
        // A poisoned lock still holds valid counters.
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
