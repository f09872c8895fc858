//! Presentation-facing events and the refresh-tick batcher.
//!
//! Workers, the connection actor and the dispatcher never touch presentation
//! state directly. Everything they want shown flows through `AppEvent`s into
//! the batcher, which buffers and hands out `Vec<AppEvent>` batches on a
//! fixed refresh tick. Under a message flood the presentation layer sees one
//! batch per tick instead of one wakeup per message.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::broadcast::JobSummary;
use crate::broker::ConnectionState;
use crate::history::HistoryEntry;

#[derive(Debug, Clone)]
pub enum AppEvent {
    Connection(ConnectionState),
    Message(HistoryEntry),
    JobProgress { id: u64, sent: u64, failed: u64 },
    JobFinished(JobSummary),
    ScanCompleted(Vec<SocketAddr>),
    ScanFailed(String),
    StatsReset,
    HistoryExported { path: std::path::PathBuf, entries: usize },
    Error(String),
}

/// Spawns the batching task.
///
/// Events from `rx` are buffered and flushed to `batches` whenever the
/// refresh tick fires and the buffer is non-empty. The tick length follows
/// `interval_rx`, so "apply advanced settings" takes effect immediately.
/// Remaining events are flushed when the event channel closes.
pub fn spawn_batcher(
    mut rx: mpsc::Receiver<AppEvent>,
    batches: mpsc::Sender<Vec<AppEvent>>,
    mut interval_rx: watch::Receiver<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: Vec<AppEvent> = Vec::new();
        let mut ticker = tokio::time::interval(*interval_rx.borrow());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut interval_closed = false;

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => pending.push(event),
                    None => {
                        if !pending.is_empty() {
                            let _ = batches.send(std::mem::take(&mut pending)).await;
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        let _ = batches.send(std::mem::take(&mut pending)).await;
                    }
                },
                changed = interval_rx.changed(), if !interval_closed => match changed {
                    Ok(()) => {
                        let refresh = *interval_rx.borrow_and_update();
                        ticker = tokio::time::interval(refresh);
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    }
                    Err(_) => interval_closed = true,
                },
            }
        }
        debug!("event batcher stopped");
    })
}
