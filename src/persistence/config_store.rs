use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::AppConfig;
use crate::stats::StatsStore;

const CONFIG_DIR: &str = ".config/mqtt-broadcaster";
const CONFIG_FILE: &str = "config.toml";

pub fn default_config_dir() -> PathBuf {
    let mut base = dirs::home_dir().unwrap_or_else(|| {
        warn!("could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    base.push(CONFIG_DIR);
    base
}

/// Loads and saves the TOML application configuration.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn at_default_location() -> Self {
        Self {
            path: default_config_dir().join(CONFIG_FILE),
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Writes a default configuration file if none exists yet.
    pub async fn ensure_default(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }

        info!("creating default configuration at {}", self.path.display());
        self.save(&AppConfig::default()).await
    }

    /// Loads the configuration. A missing or corrupt file yields defaults;
    /// startup never fails over bad configuration.
    pub async fn load(&self) -> AppConfig {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "could not read config file {}, using defaults: {}",
                    self.path.display(),
                    e
                );
                return AppConfig::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "config file {} is invalid, using defaults: {}",
                    self.path.display(),
                    e
                );
                AppConfig::default()
            }
        }
    }

    pub async fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;

        debug!("configuration saved to {}", self.path.display());
        Ok(())
    }
}

/// Periodically writes the channel statistics to disk so a crash loses at
/// most one interval of counters.
pub fn start_stats_autosave(
    stats: Arc<StatsStore>,
    path: PathBuf,
    interval_secs: u64,
) -> JoinHandle<()> {
    info!("starting statistics autosave task with interval {}s", interval_secs);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.tick().await;

        loop {
            interval.tick().await;

            if let Err(e) = stats.save(&path) {
                error!("failed to autosave statistics: {}", e);
            } else {
                debug!("statistics autosaved");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_default_creates_the_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::with_path(dir.path().join("config.toml"));

        store.ensure_default().await.unwrap();
        assert!(store.path().exists());

        // A second call must not overwrite an existing file.
        let mut customized = AppConfig::default();
        customized.history_cap = 42;
        store.save(&customized).await.unwrap();
        store.ensure_default().await.unwrap();
        assert_eq!(store.load().await.history_cap, 42);
    }

    #[tokio::test]
    async fn corrupt_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "this is [not valid toml").await.unwrap();

        let store = ConfigStore::with_path(path);
        assert_eq!(store.load().await, AppConfig::default());
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::with_path(dir.path().join("nope.toml"));
        assert_eq!(store.load().await, AppConfig::default());
    }

    #[tokio::test]
    async fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::with_path(dir.path().join("config.toml"));

        let mut config = AppConfig::default();
        config.broker.host = "10.0.0.7".to_string();
        config.broker.port = 8883;
        config.subscriptions = vec!["sensors/#".to_string(), "home/+/state".to_string()];
        config.broadcast.workers = 4;

        store.save(&config).await.unwrap();
        assert_eq!(store.load().await, config);
    }
}
