//! Command surface and central event dispatcher.
//!
//! The presentation layer talks to the core exclusively through
//! [`AppCommand`]s and receives batched [`AppEvent`]s back. One dispatcher
//! task consumes everything the connection actor, the broadcast jobs and the
//! scanner produce, updates the statistics store and the message history,
//! and forwards presentation-facing events into the batcher. Nothing in here
//! blocks on a broker or broadcast operation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastJob, Broadcaster, JobEvent, JobHandle, MAX_WORKERS};
use crate::broker::{qos_from_level, BrokerConfig, BrokerEvent, BrokerHandle, ConnectionState};
use crate::events::AppEvent;
use crate::history::{Direction, HistoryEntry, MessageHistory};
use crate::persistence::config_store::ConfigStore;
use crate::persistence::AppConfig;
use crate::scanner::{self, ScanError};
use crate::stats::StatsStore;

/// Runtime-adjustable knobs from the advanced settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvancedSettings {
    pub refresh_interval_ms: u64,
    pub history_cap: usize,
    pub default_workers: usize,
}

/// Everything the presentation layer can ask the core to do.
#[derive(Debug)]
pub enum AppCommand {
    Connect(BrokerConfig),
    Disconnect,
    Subscribe { pattern: String, qos: u8 },
    Unsubscribe { pattern: String },
    StartBroadcast(BroadcastJob),
    CancelBroadcast { id: u64 },
    ApplySettings(AdvancedSettings),
    ResetStats,
    SaveStats,
    Scan,
    ConnectToScanned { index: usize },
    ExportHistory { path: PathBuf },
    ClearHistory,
}

pub struct App {
    broker: BrokerHandle,
    broadcaster: Broadcaster,
    stats: Arc<StatsStore>,
    history: Arc<MessageHistory>,
    ui_events: mpsc::Sender<AppEvent>,
    refresh_tx: watch::Sender<Duration>,
    config_store: ConfigStore,
    config: AppConfig,
    jobs: HashMap<u64, JobHandle>,
    scan_tx: mpsc::Sender<Result<Vec<SocketAddr>, ScanError>>,
    scan_results: Vec<SocketAddr>,
    scanner_enabled: bool,
    default_workers: usize,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: BrokerHandle,
        broadcaster: Broadcaster,
        stats: Arc<StatsStore>,
        history: Arc<MessageHistory>,
        ui_events: mpsc::Sender<AppEvent>,
        refresh_tx: watch::Sender<Duration>,
        config_store: ConfigStore,
        config: AppConfig,
        scan_tx: mpsc::Sender<Result<Vec<SocketAddr>, ScanError>>,
    ) -> Self {
        let default_workers = config.broadcast.workers.clamp(1, MAX_WORKERS);
        Self {
            broker,
            broadcaster,
            stats,
            history,
            ui_events,
            refresh_tx,
            config_store,
            config,
            jobs: HashMap::new(),
            scan_tx,
            scan_results: Vec::new(),
            scanner_enabled: true,
            default_workers,
        }
    }

    pub async fn handle_command(&mut self, cmd: AppCommand) {
        match cmd {
            AppCommand::Connect(config) => {
                self.config.broker = config.clone();
                if let Err(e) = self.broker.connect(config).await {
                    self.emit(AppEvent::Error(format!("connect failed: {e}"))).await;
                }
            }
            AppCommand::Disconnect => {
                self.broker.disconnect().await;
            }
            AppCommand::Subscribe { pattern, qos } => {
                match self.broker.subscribe(&pattern, qos_from_level(qos)).await {
                    Ok(()) => {
                        info!("subscribed to {}", pattern);
                        if !self.config.subscriptions.contains(&pattern) {
                            self.config.subscriptions.push(pattern);
                        }
                    }
                    Err(e) => {
                        self.emit(AppEvent::Error(format!("subscribe to {pattern} failed: {e}")))
                            .await;
                    }
                }
            }
            AppCommand::Unsubscribe { pattern } => {
                match self.broker.unsubscribe(&pattern).await {
                    Ok(()) => {
                        info!("unsubscribed from {}", pattern);
                        self.config.subscriptions.retain(|p| p != &pattern);
                    }
                    Err(e) => {
                        self.emit(AppEvent::Error(format!(
                            "unsubscribe from {pattern} failed: {e}"
                        )))
                        .await;
                    }
                }
            }
            AppCommand::StartBroadcast(mut job) => {
                if job.workers == 0 {
                    job.workers = self.default_workers;
                }
                match self.broadcaster.start(job) {
                    Ok(handle) => {
                        self.jobs.insert(handle.id(), handle);
                    }
                    Err(e) => {
                        self.emit(AppEvent::Error(format!("broadcast not started: {e}"))).await;
                    }
                }
            }
            AppCommand::CancelBroadcast { id } => match self.jobs.get(&id) {
                Some(handle) => {
                    info!(
                        "cancelling broadcast job {} after {} sends",
                        id,
                        handle.sent_so_far()
                    );
                    handle.cancel();
                }
                None => {
                    self.emit(AppEvent::Error(format!("no running broadcast with id {id}")))
                        .await;
                }
            },
            AppCommand::ApplySettings(settings) => {
                self.default_workers = settings.default_workers.clamp(1, MAX_WORKERS);
                self.history.set_cap(settings.history_cap);
                self.config.broadcast.workers = self.default_workers;
                self.config.history_cap = settings.history_cap;
                self.config.refresh_interval_ms = settings.refresh_interval_ms.max(10);
                let _ = self
                    .refresh_tx
                    .send(Duration::from_millis(self.config.refresh_interval_ms));
                info!(
                    "settings applied: refresh {}ms, history cap {}, {} workers",
                    self.config.refresh_interval_ms, self.config.history_cap, self.default_workers
                );
            }
            AppCommand::ResetStats => {
                self.stats.reset_all();
                self.emit(AppEvent::StatsReset).await;
            }
            AppCommand::SaveStats => {
                if let Err(e) = self.stats.save(&self.config.stats_file) {
                    self.emit(AppEvent::Error(format!("saving statistics failed: {e}"))).await;
                }
            }
            AppCommand::Scan => {
                if !self.scanner_enabled {
                    self.emit(AppEvent::Error(
                        "scanner is disabled for this session".to_string(),
                    ))
                    .await;
                    return;
                }
                let config = self.config.scanner.clone();
                let results = self.scan_tx.clone();
                tokio::spawn(async move {
                    let outcome = scanner::scan(&config).await;
                    let _ = results.send(outcome).await;
                });
            }
            AppCommand::ConnectToScanned { index } => match self.scan_results.get(index) {
                Some(addr) => {
                    let mut config = self.config.broker.clone();
                    config.host = addr.ip().to_string();
                    config.port = addr.port();
                    self.config.broker = config.clone();
                    if let Err(e) = self.broker.connect(config).await {
                        self.emit(AppEvent::Error(format!("connect failed: {e}"))).await;
                    }
                }
                None => {
                    self.emit(AppEvent::Error(format!("no scan result at index {index}")))
                        .await;
                }
            },
            AppCommand::ExportHistory { path } => match self.history.export_csv(&path) {
                Ok(entries) => {
                    self.emit(AppEvent::HistoryExported { path, entries }).await;
                }
                Err(e) => {
                    self.emit(AppEvent::Error(format!("export failed: {e}"))).await;
                }
            },
            AppCommand::ClearHistory => {
                let cleared = self.history.len();
                self.history.clear();
                info!("cleared {} history entries", cleared);
            }
        }
    }

    pub async fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::StateChanged(state) => {
                if state == ConnectionState::Connected {
                    self.resubscribe().await;
                }
                self.emit(AppEvent::Connection(state)).await;
            }
            BrokerEvent::Message { channel, payload } => {
                self.stats.record_received(&channel);
                let entry = HistoryEntry::now(channel, Direction::Received, payload);
                self.history.push(entry.clone());
                self.emit(AppEvent::Message(entry)).await;
            }
            BrokerEvent::Error(reason) => {
                self.emit(AppEvent::Error(reason)).await;
            }
        }
    }

    pub async fn handle_job_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Progress { id, sent, failed } => {
                self.emit(AppEvent::JobProgress { id, sent, failed }).await;
            }
            JobEvent::Finished(summary) => {
                self.jobs.remove(&summary.id);
                self.emit(AppEvent::JobFinished(summary)).await;
            }
        }
    }

    pub async fn handle_scan_result(&mut self, result: Result<Vec<SocketAddr>, ScanError>) {
        match result {
            Ok(found) => {
                self.scan_results = found.clone();
                self.emit(AppEvent::ScanCompleted(found)).await;
            }
            Err(e) => {
                warn!("scan failed, disabling scanner for this session: {}", e);
                self.scanner_enabled = false;
                self.emit(AppEvent::ScanFailed(e.to_string())).await;
            }
        }
    }

    /// Replays the saved subscriptions after a successful connect.
    async fn resubscribe(&mut self) {
        for pattern in self.config.subscriptions.clone() {
            if let Err(e) = self
                .broker
                .subscribe(&pattern, qos_from_level(self.config.broadcast.qos))
                .await
            {
                warn!("re-subscribe to {} failed: {}", pattern, e);
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down, persisting state");
        for (id, handle) in self.jobs.drain() {
            debug!("cancelling broadcast job {}", id);
            handle.cancel();
        }
        if let Err(e) = self.stats.save(&self.config.stats_file) {
            warn!("failed to save statistics on shutdown: {}", e);
        }
        if let Err(e) = self.config_store.save(&self.config).await {
            warn!("failed to save configuration on shutdown: {}", e);
        }
    }

    async fn emit(&self, event: AppEvent) {
        let _ = self.ui_events.send(event).await;
    }

    #[cfg(test)]
    pub(crate) fn scanner_enabled(&self) -> bool {
        self.scanner_enabled
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self) -> &[String] {
        &self.config.subscriptions
    }
}

/// Drives the application until the command channel closes.
pub async fn run_dispatcher(
    mut app: App,
    mut commands: mpsc::Receiver<AppCommand>,
    mut broker_events: mpsc::Receiver<BrokerEvent>,
    mut job_events: mpsc::Receiver<JobEvent>,
    mut scan_results: mpsc::Receiver<Result<Vec<SocketAddr>, ScanError>>,
) {
    let mut broker_open = true;
    let mut jobs_open = true;
    let mut scans_open = true;

    loop {
        tokio::select! {
            maybe = commands.recv() => match maybe {
                Some(cmd) => app.handle_command(cmd).await,
                None => break,
            },
            maybe = broker_events.recv(), if broker_open => match maybe {
                Some(event) => app.handle_broker_event(event).await,
                None => broker_open = false,
            },
            maybe = job_events.recv(), if jobs_open => match maybe {
                Some(event) => app.handle_job_event(event).await,
                None => jobs_open = false,
            },
            maybe = scan_results.recv(), if scans_open => match maybe {
                Some(result) => app.handle_scan_result(result).await,
                None => scans_open = false,
            },
        }
    }

    app.shutdown().await;
    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::BrokerCommand;

    struct Harness {
        app: App,
        ui_rx: mpsc::Receiver<AppEvent>,
        broker_rx: mpsc::Receiver<BrokerCommand>,
        _scan_rx: mpsc::Receiver<Result<Vec<SocketAddr>, ScanError>>,
    }

    fn harness(dir: &tempfile::TempDir) -> Harness {
        let (broker_cmd_tx, broker_rx) = mpsc::channel(64);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let broker = BrokerHandle::from_parts(broker_cmd_tx, state_rx);

        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let history = Arc::new(MessageHistory::new(100));
        let (job_events_tx, _job_events_rx) = mpsc::channel(64);
        let broadcaster = Broadcaster::new(
            broker.clone(),
            stats.clone(),
            history.clone(),
            job_events_tx,
            Duration::from_millis(50),
        );
        let (ui_tx, ui_rx) = mpsc::channel(64);
        let (refresh_tx, _refresh_rx) = watch::channel(Duration::from_millis(250));
        let (scan_tx, _scan_rx) = mpsc::channel(4);

        let mut config = AppConfig::default();
        config.stats_file = dir.path().join("stats.json");
        let config_store = ConfigStore::with_path(dir.path().join("config.toml"));

        Harness {
            app: App::new(
                broker,
                broadcaster,
                stats,
                history,
                ui_tx,
                refresh_tx,
                config_store,
                config,
                scan_tx,
            ),
            ui_rx,
            broker_rx,
            _scan_rx,
        }
    }

    /// Answers subscribe/unsubscribe commands with Ok until dropped.
    fn ack_broker_commands(mut rx: mpsc::Receiver<BrokerCommand>) {
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    BrokerCommand::Subscribe { respond, .. } => {
                        let _ = respond.send(Ok(()));
                    }
                    BrokerCommand::Unsubscribe { respond, .. } => {
                        let _ = respond.send(Ok(()));
                    }
                    BrokerCommand::Publish { respond, .. } => {
                        let _ = respond.send(Ok(()));
                    }
                    BrokerCommand::Disconnect { respond } => {
                        let _ = respond.send(());
                    }
                    BrokerCommand::Connect { respond, .. } => {
                        let _ = respond.send(Ok(ConnectionState::Connecting));
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn subscribe_remembers_the_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&dir);
        ack_broker_commands(h.broker_rx);

        h.app
            .handle_command(AppCommand::Subscribe {
                pattern: "sensors/#".to_string(),
                qos: 1,
            })
            .await;
        assert_eq!(h.app.subscriptions(), ["sensors/#"]);

        // Subscribing twice keeps a single saved entry.
        h.app
            .handle_command(AppCommand::Subscribe {
                pattern: "sensors/#".to_string(),
                qos: 1,
            })
            .await;
        assert_eq!(h.app.subscriptions(), ["sensors/#"]);

        h.app
            .handle_command(AppCommand::Unsubscribe {
                pattern: "sensors/#".to_string(),
            })
            .await;
        assert!(h.app.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn incoming_message_updates_stats_history_and_ui() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&dir);

        h.app
            .handle_broker_event(BrokerEvent::Message {
                channel: "sensors/temp".to_string(),
                payload: "21.5".to_string(),
            })
            .await;

        assert_eq!(h.app.stats.snapshot()["sensors/temp"].received, 1);
        assert_eq!(h.app.history.len(), 1);
        match h.ui_rx.recv().await.unwrap() {
            AppEvent::Message(entry) => {
                assert_eq!(entry.channel, "sensors/temp");
                assert_eq!(entry.payload, "21.5");
                assert_eq!(entry.direction, Direction::Received);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_scan_disables_the_scanner() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&dir);

        h.app
            .handle_scan_result(Err(ScanError::LocalAddr("no route".to_string())))
            .await;
        assert!(!h.app.scanner_enabled());
        assert!(matches!(
            h.ui_rx.recv().await.unwrap(),
            AppEvent::ScanFailed(_)
        ));

        h.app.handle_command(AppCommand::Scan).await;
        assert!(matches!(h.ui_rx.recv().await.unwrap(), AppEvent::Error(_)));
    }

    #[tokio::test]
    async fn cancel_with_unknown_id_reports_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&dir);

        h.app
            .handle_command(AppCommand::CancelBroadcast { id: 99 })
            .await;
        assert!(matches!(h.ui_rx.recv().await.unwrap(), AppEvent::Error(_)));
    }

    #[tokio::test]
    async fn reset_stats_clears_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&dir);

        h.app.stats.record_received("a");
        h.app.handle_command(AppCommand::ResetStats).await;
        assert!(h.app.stats.snapshot().is_empty());
        assert!(matches!(
            h.ui_rx.recv().await.unwrap(),
            AppEvent::StatsReset
        ));
    }

    #[tokio::test]
    async fn connecting_after_connected_event_replays_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&dir);

        // Answer the subscribe calls and count them.
        let (seen_tx, mut seen_rx) = mpsc::channel(8);
        let mut broker_rx = h.broker_rx;
        tokio::spawn(async move {
            while let Some(cmd) = broker_rx.recv().await {
                if let BrokerCommand::Subscribe {
                    pattern, respond, ..
                } = cmd
                {
                    let _ = respond.send(Ok(()));
                    let _ = seen_tx.send(pattern).await;
                }
            }
        });

        h.app.config.subscriptions = vec!["a/#".to_string(), "b/+".to_string()];
        h.app
            .handle_broker_event(BrokerEvent::StateChanged(ConnectionState::Connected))
            .await;

        assert_eq!(seen_rx.recv().await.unwrap(), "a/#");
        assert_eq!(seen_rx.recv().await.unwrap(), "b/+");
        assert!(matches!(
            h.ui_rx.recv().await.unwrap(),
            AppEvent::Connection(ConnectionState::Connected)
        ));
    }

    #[tokio::test]
    async fn apply_settings_updates_refresh_watch_and_history_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (broker_cmd_tx, _broker_rx) = mpsc::channel(64);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let broker = BrokerHandle::from_parts(broker_cmd_tx, state_rx);

        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let history = Arc::new(MessageHistory::new(100));
        let (job_events_tx, _job_events_rx) = mpsc::channel(64);
        let broadcaster = Broadcaster::new(
            broker.clone(),
            stats.clone(),
            history.clone(),
            job_events_tx,
            Duration::from_millis(50),
        );
        let (ui_tx, _ui_rx) = mpsc::channel(64);
        let (refresh_tx, refresh_rx) = watch::channel(Duration::from_millis(250));
        let (scan_tx, _scan_rx) = mpsc::channel(4);
        let mut config = AppConfig::default();
        config.stats_file = dir.path().join("stats.json");

        let mut app = App::new(
            broker,
            broadcaster,
            stats,
            history.clone(),
            ui_tx,
            refresh_tx,
            ConfigStore::with_path(dir.path().join("config.toml")),
            config,
            scan_tx,
        );

        app.handle_command(AppCommand::ApplySettings(AdvancedSettings {
            refresh_interval_ms: 100,
            history_cap: 7,
            default_workers: 64,
        }))
        .await;

        assert_eq!(*refresh_rx.borrow(), Duration::from_millis(100));
        for n in 0..20 {
            history.push(HistoryEntry::now("t", Direction::Sent, format!("{n}")));
        }
        assert_eq!(history.len(), 7);
    }
}
