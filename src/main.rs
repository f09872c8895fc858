pub mod app;
pub mod broadcast;
pub mod broker;
pub mod events;
pub mod history;
pub mod persistence;
pub mod scanner;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::app::{AdvancedSettings, App, AppCommand};
use crate::broadcast::{BroadcastJob, Broadcaster, TargetSet};
use crate::broker::{qos_from_level, BrokerHandle};
use crate::events::AppEvent;
use crate::history::MessageHistory;
use crate::persistence::config_store::{start_stats_autosave, ConfigStore};
use crate::persistence::AppConfig;
use crate::stats::StatsStore;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_store = ConfigStore::at_default_location();
    config_store.ensure_default().await?;
    let config = config_store.load().await;
    info!(
        "configuration loaded, default broker {}:{}",
        config.broker.host, config.broker.port
    );

    let stats = Arc::new(StatsStore::load(
        &config.stats_file,
        Duration::from_secs(config.freshness_window_secs),
    ));
    let history = Arc::new(MessageHistory::new(config.history_cap));

    let (broker_event_tx, broker_event_rx) = mpsc::channel(256);
    let broker = BrokerHandle::spawn(broker_event_tx);

    let (job_event_tx, job_event_rx) = mpsc::channel(256);
    let broadcaster = Broadcaster::new(
        broker.clone(),
        stats.clone(),
        history.clone(),
        job_event_tx,
        Duration::from_millis(config.refresh_interval_ms),
    );

    let (ui_event_tx, ui_event_rx) = mpsc::channel(1024);
    let (refresh_tx, refresh_rx) =
        watch::channel(Duration::from_millis(config.refresh_interval_ms));
    let (batch_tx, mut batch_rx) = mpsc::channel(64);
    let _batcher = events::spawn_batcher(ui_event_rx, batch_tx, refresh_rx);

    let _autosave = start_stats_autosave(
        stats.clone(),
        config.stats_file.clone(),
        config.stats_autosave_secs,
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (scan_tx, scan_rx) = mpsc::channel(4);
    let connection = broker.clone();
    let app = App::new(
        broker,
        broadcaster,
        stats.clone(),
        history,
        ui_event_tx,
        refresh_tx,
        config_store,
        config.clone(),
        scan_tx,
    );
    let dispatcher = tokio::spawn(app::run_dispatcher(
        app,
        cmd_rx,
        broker_event_rx,
        job_event_rx,
        scan_rx,
    ));

    // Event printer: the only place batched events reach the terminal.
    tokio::spawn(async move {
        while let Some(batch) = batch_rx.recv().await {
            for event in batch {
                println!("{}", render_event(&event));
            }
        }
    });

    println!("mqtt-broadcaster ready, type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_input(&line, &config) {
            Ok(Input::Empty) => {}
            Ok(Input::Help) => print_help(),
            Ok(Input::Quit) => break,
            Ok(Input::ShowStats) => print_stats(&stats),
            Ok(Input::ShowStatus) => println!("connection: {}", connection.state()),
            Ok(Input::Command(cmd)) => {
                if cmd_tx.send(cmd).await.is_err() {
                    break;
                }
            }
            Err(e) => println!("error: {e}"),
        }
    }

    drop(cmd_tx);
    let _ = dispatcher.await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();
    Ok(())
}

enum Input {
    Command(AppCommand),
    ShowStats,
    ShowStatus,
    Help,
    Quit,
    Empty,
}

fn parse_input(line: &str, config: &AppConfig) -> Result<Input, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = tokens.first() else {
        return Ok(Input::Empty);
    };

    let parsed = match command {
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        "stats" => Input::ShowStats,
        "status" => Input::ShowStatus,
        "connect" => {
            let mut broker = config.broker.clone();
            if let Some(host) = tokens.get(1) {
                broker.host = host.to_string();
            }
            if let Some(port) = tokens.get(2) {
                broker.port = port.parse().map_err(|_| format!("invalid port: {port}"))?;
            }
            Input::Command(AppCommand::Connect(broker))
        }
        "disconnect" => Input::Command(AppCommand::Disconnect),
        "sub" => {
            let pattern = tokens.get(1).ok_or("usage: sub <pattern> [qos]")?;
            let qos = match tokens.get(2) {
                Some(level) => level.parse().map_err(|_| format!("invalid qos: {level}"))?,
                None => config.broadcast.qos,
            };
            Input::Command(AppCommand::Subscribe {
                pattern: pattern.to_string(),
                qos,
            })
        }
        "unsub" => {
            let pattern = tokens.get(1).ok_or("usage: unsub <pattern>")?;
            Input::Command(AppCommand::Unsubscribe {
                pattern: pattern.to_string(),
            })
        }
        "broadcast" | "broadcast-all" => {
            let count: u64 = tokens
                .get(1)
                .ok_or("usage: broadcast <count> <workers> <message...>")?
                .parse()
                .map_err(|_| "count must be a number".to_string())?;
            let workers: usize = tokens
                .get(2)
                .ok_or("usage: broadcast <count> <workers> <message...>")?
                .parse()
                .map_err(|_| "workers must be a number".to_string())?;
            let template = tokens[3..].join(" ");
            if template.is_empty() {
                return Err("broadcast message must not be empty".to_string());
            }
            let targets = if command == "broadcast-all" {
                TargetSet::AllKnown
            } else {
                TargetSet::Channels(vec![config.broadcast.topic.clone()])
            };
            Input::Command(AppCommand::StartBroadcast(BroadcastJob {
                template,
                targets,
                count,
                interval: Duration::from_millis(config.broadcast.interval_ms),
                workers,
                qos: qos_from_level(config.broadcast.qos),
                retain: config.broadcast.retain,
                append_counter: config.broadcast.append_counter,
            }))
        }
        "cancel" => {
            let id = tokens
                .get(1)
                .ok_or("usage: cancel <job-id>")?
                .parse()
                .map_err(|_| "job id must be a number".to_string())?;
            Input::Command(AppCommand::CancelBroadcast { id })
        }
        "scan" => Input::Command(AppCommand::Scan),
        "connect-scanned" => {
            let index = tokens
                .get(1)
                .ok_or("usage: connect-scanned <index>")?
                .parse()
                .map_err(|_| "index must be a number".to_string())?;
            Input::Command(AppCommand::ConnectToScanned { index })
        }
        "reset-stats" => Input::Command(AppCommand::ResetStats),
        "save-stats" => Input::Command(AppCommand::SaveStats),
        "export" => {
            let path = tokens.get(1).ok_or("usage: export <path>")?;
            Input::Command(AppCommand::ExportHistory {
                path: (*path).into(),
            })
        }
        "clear" => Input::Command(AppCommand::ClearHistory),
        "settings" => {
            let usage = "usage: settings <refresh-ms> <history-cap> <workers>";
            let refresh_interval_ms = tokens.get(1).ok_or(usage)?.parse().map_err(|_| usage)?;
            let history_cap = tokens.get(2).ok_or(usage)?.parse().map_err(|_| usage)?;
            let default_workers = tokens.get(3).ok_or(usage)?.parse().map_err(|_| usage)?;
            Input::Command(AppCommand::ApplySettings(AdvancedSettings {
                refresh_interval_ms,
                history_cap,
                default_workers,
            }))
        }
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(parsed)
}

fn render_event(event: &AppEvent) -> String {
    match event {
        AppEvent::Connection(state) => format!("[connection] {state}"),
        AppEvent::Message(entry) => format!(
            "[{}] {} {}: {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.direction,
            entry.channel,
            entry.payload
        ),
        AppEvent::JobProgress { id, sent, failed } => {
            format!("[job {id}] {sent} sent, {failed} failed")
        }
        AppEvent::JobFinished(summary) => format!(
            "[job {}] {:?}: {} sent, {} failed",
            summary.id, summary.outcome, summary.sent, summary.failed
        ),
        AppEvent::ScanCompleted(found) => {
            if found.is_empty() {
                "[scan] no brokers found".to_string()
            } else {
                let list: Vec<String> = found
                    .iter()
                    .enumerate()
                    .map(|(i, addr)| format!("{i}: {addr}"))
                    .collect();
                format!(
                    "[scan] found {} broker(s)\n  {}",
                    found.len(),
                    list.join("\n  ")
                )
            }
        }
        AppEvent::ScanFailed(reason) => format!("[scan] failed: {reason}"),
        AppEvent::StatsReset => "[stats] reset".to_string(),
        AppEvent::HistoryExported { path, entries } => {
            format!("[export] {} entries written to {}", entries, path.display())
        }
        AppEvent::Error(reason) => format!("[error] {reason}"),
    }
}

fn print_stats(stats: &StatsStore) {
    let snapshot = stats.snapshot();
    if snapshot.is_empty() {
        println!("no channel activity yet");
        return;
    }
    let now = chrono::Utc::now();
    let mut channels: Vec<_> = snapshot.into_iter().collect();
    channels.sort_by(|a, b| a.0.cmp(&b.0));
    for (channel, entry) in channels {
        let status = if stats.is_online(&channel, now) {
            "online"
        } else {
            "offline"
        };
        println!(
            "{channel}: {} sent, {} received, {status}",
            entry.sent, entry.received
        );
    }
}

fn print_help() {
    println!(
        "commands:\n\
         \x20 connect [host] [port]                 connect to a broker\n\
         \x20 disconnect                            drop the connection\n\
         \x20 sub <pattern> [qos]                   subscribe (wildcards ok)\n\
         \x20 unsub <pattern>                       unsubscribe\n\
         \x20 broadcast <count> <workers> <msg...>  broadcast to the default topic\n\
         \x20 broadcast-all <count> <workers> <msg...>  broadcast to all known channels\n\
         \x20 cancel <job-id>                       cancel a running broadcast\n\
         \x20 scan                                  sweep the local network for brokers\n\
         \x20 connect-scanned <index>               connect to a scan result\n\
         \x20 stats                                 show channel statistics\n\
         \x20 status                                show connection state\n\
         \x20 reset-stats | save-stats              reset or persist statistics\n\
         \x20 export <path>                         export message history as CSV\n\
         \x20 clear                                 clear message history\n\
         \x20 settings <refresh-ms> <cap> <workers> apply advanced settings\n\
         \x20 quit"
    );
}
