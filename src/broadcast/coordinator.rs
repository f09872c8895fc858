use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerHandle, PublishError};
use crate::history::{Direction, HistoryEntry, MessageHistory};
use crate::stats::StatsStore;

use super::job::{BroadcastJob, JobEvent, JobOutcome, JobSummary, TargetSet};

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("broadcast has no target channels")]
    NoTargets,

    #[error("broadcast message count must be positive")]
    ZeroCount,

    #[error("broadcast message must not be empty")]
    EmptyTemplate,
}

/// Spawns and supervises broadcast jobs.
pub struct Broadcaster {
    broker: BrokerHandle,
    stats: Arc<StatsStore>,
    history: Arc<MessageHistory>,
    events: mpsc::Sender<JobEvent>,
    progress_interval: Duration,
    next_id: AtomicU64,
}

/// Handle to one running job. Cancellation is cooperative: workers check the
/// token between sends, and the job only reports stopped once every worker
/// has finished.
pub struct JobHandle {
    id: u64,
    token: CancellationToken,
    sent: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    supervisor: JoinHandle<JobSummary>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Current number of publishes that have actually happened.
    pub fn sent_so_far(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Waits until every worker has stopped and returns the final summary.
    pub async fn join(self) -> JobSummary {
        let JobHandle {
            id,
            sent,
            failed,
            supervisor,
            ..
        } = self;
        match supervisor.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("broadcast supervisor for job {} died: {}", id, e);
                JobSummary {
                    id,
                    outcome: JobOutcome::Failed,
                    sent: sent.load(Ordering::Relaxed),
                    failed: failed.load(Ordering::Relaxed),
                }
            }
        }
    }
}

struct WorkerContext {
    worker_idx: usize,
    first_index: u64,
    share: u64,
    job: Arc<BroadcastJob>,
    channels: Arc<Vec<String>>,
    broker: BrokerHandle,
    stats: Arc<StatsStore>,
    history: Arc<MessageHistory>,
    token: CancellationToken,
    sent: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    connection_lost: Arc<AtomicBool>,
}

impl Broadcaster {
    pub fn new(
        broker: BrokerHandle,
        stats: Arc<StatsStore>,
        history: Arc<MessageHistory>,
        events: mpsc::Sender<JobEvent>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            broker,
            stats,
            history,
            events,
            progress_interval,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn start(&self, job: BroadcastJob) -> Result<JobHandle, BroadcastError> {
        if job.count == 0 {
            return Err(BroadcastError::ZeroCount);
        }
        if job.template.is_empty() {
            return Err(BroadcastError::EmptyTemplate);
        }
        let channels: Vec<String> = match &job.targets {
            TargetSet::Channels(list) => list.clone(),
            TargetSet::AllKnown => self.stats.channel_names(),
        };
        if channels.is_empty() {
            return Err(BroadcastError::NoTargets);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let sent = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let connection_lost = Arc::new(AtomicBool::new(false));
        let job = Arc::new(job);
        let channels = Arc::new(channels);

        let shares = job.worker_shares();
        info!(
            "starting broadcast job {}: {} messages over {} workers to {} channels",
            id,
            job.count,
            shares.len(),
            channels.len()
        );

        let mut workers = Vec::with_capacity(shares.len());
        let mut first_index = 0u64;
        for (worker_idx, share) in shares.into_iter().enumerate() {
            workers.push(tokio::spawn(run_worker(WorkerContext {
                worker_idx,
                first_index,
                share,
                job: job.clone(),
                channels: channels.clone(),
                broker: self.broker.clone(),
                stats: self.stats.clone(),
                history: self.history.clone(),
                token: token.clone(),
                sent: sent.clone(),
                failed: failed.clone(),
                connection_lost: connection_lost.clone(),
            })));
            first_index += share;
        }

        let supervisor = tokio::spawn(supervise(
            id,
            workers,
            self.events.clone(),
            self.progress_interval,
            token.clone(),
            sent.clone(),
            failed.clone(),
            connection_lost,
        ));

        Ok(JobHandle {
            id,
            token,
            sent,
            failed,
            supervisor,
        })
    }
}

async fn run_worker(ctx: WorkerContext) {
    for offset in 0..ctx.share {
        if ctx.token.is_cancelled() {
            break;
        }

        let index = ctx.first_index + offset;
        let channel = &ctx.channels[(index % ctx.channels.len() as u64) as usize];
        let payload = ctx.job.render_message(index);

        match ctx
            .broker
            .publish(channel, &payload, ctx.job.qos, ctx.job.retain)
            .await
        {
            Ok(()) => {
                ctx.sent.fetch_add(1, Ordering::Relaxed);
                ctx.stats.record_sent(channel);
                ctx.history
                    .push(HistoryEntry::now(channel.clone(), Direction::Sent, payload));
            }
            Err(PublishError::Rejected(reason)) => {
                // A single rejection does not abort the rest of the job.
                ctx.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "worker {}: publish to {} rejected: {}",
                    ctx.worker_idx, channel, reason
                );
            }
            Err(PublishError::ConnectionLost) => {
                warn!(
                    "worker {}: connection lost, stopping broadcast",
                    ctx.worker_idx
                );
                ctx.connection_lost.store(true, Ordering::Relaxed);
                ctx.token.cancel();
                break;
            }
        }

        if !ctx.job.interval.is_zero() && offset + 1 < ctx.share {
            tokio::select! {
                _ = ctx.token.cancelled() => break,
                _ = tokio::time::sleep(ctx.job.interval) => {}
            }
        }
    }
    debug!("worker {} done", ctx.worker_idx);
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    id: u64,
    workers: Vec<JoinHandle<()>>,
    events: mpsc::Sender<JobEvent>,
    progress_interval: Duration,
    token: CancellationToken,
    sent: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    connection_lost: Arc<AtomicBool>,
) -> JobSummary {
    let workers_done = async move {
        for worker in workers {
            let _ = worker.await;
        }
    };
    tokio::pin!(workers_done);

    let mut ticker = tokio::time::interval(progress_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut workers_done => break,
            _ = ticker.tick() => {
                let _ = events
                    .send(JobEvent::Progress {
                        id,
                        sent: sent.load(Ordering::Relaxed),
                        failed: failed.load(Ordering::Relaxed),
                    })
                    .await;
            }
        }
    }

    let outcome = if connection_lost.load(Ordering::Relaxed) {
        JobOutcome::Failed
    } else if token.is_cancelled() {
        JobOutcome::Cancelled
    } else {
        JobOutcome::Completed
    };

    let summary = JobSummary {
        id,
        outcome,
        sent: sent.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    };
    info!(
        "broadcast job {} finished: {:?}, {} sent, {} failed",
        id, summary.outcome, summary.sent, summary.failed
    );
    let _ = events.send(JobEvent::Finished(summary.clone())).await;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::BrokerCommand;
    use crate::broker::ConnectionState;
    use rumqttc::QoS;
    use tokio::sync::watch;

    /// Broker stand-in answering publish commands directly. With
    /// `fail_after`, every publish past that many reports a lost connection.
    fn stub_broker(fail_after: Option<u64>) -> (BrokerHandle, Arc<AtomicU64>) {
        let (commands, mut rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let published = Arc::new(AtomicU64::new(0));
        let counter = published.clone();
        tokio::spawn(async move {
            let _state_tx = state_tx;
            while let Some(cmd) = rx.recv().await {
                if let BrokerCommand::Publish { respond, .. } = cmd {
                    let already = counter.load(Ordering::SeqCst);
                    let result = match fail_after {
                        Some(limit) if already >= limit => Err(PublishError::ConnectionLost),
                        _ => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    };
                    let _ = respond.send(result);
                }
            }
        });
        (BrokerHandle::from_parts(commands, state_rx), published)
    }

    fn broadcaster(
        broker: BrokerHandle,
        stats: Arc<StatsStore>,
    ) -> (Broadcaster, Arc<MessageHistory>, mpsc::Receiver<JobEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let history = Arc::new(MessageHistory::new(1_000));
        (
            Broadcaster::new(
                broker,
                stats,
                history.clone(),
                events,
                Duration::from_millis(20),
            ),
            history,
            events_rx,
        )
    }

    fn job(count: u64, workers: usize, channels: Vec<&str>) -> BroadcastJob {
        BroadcastJob {
            template: "ping".to_string(),
            targets: TargetSet::Channels(channels.into_iter().map(String::from).collect()),
            count,
            interval: Duration::ZERO,
            workers,
            qos: QoS::AtMostOnce,
            retain: false,
            append_counter: false,
        }
    }

    #[tokio::test]
    async fn ten_messages_two_workers_publish_exactly_ten() {
        let (broker, published) = stub_broker(None);
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let (broadcaster, history, _events) = broadcaster(broker, stats.clone());

        let handle = broadcaster.start(job(10, 2, vec!["a", "b"])).unwrap();
        let summary = handle.join().await;

        assert_eq!(summary.outcome, JobOutcome::Completed);
        assert_eq!(summary.sent, 10);
        assert_eq!(summary.failed, 0);
        assert_eq!(published.load(Ordering::SeqCst), 10);

        // Indices cycle over the two channels, so each gets half.
        let snapshot = stats.snapshot();
        assert_eq!(snapshot["a"].sent, 5);
        assert_eq!(snapshot["b"].sent, 5);

        // Every successful publish also lands in the history buffer.
        assert_eq!(history.len(), 10);
        assert!(history
            .entries()
            .iter()
            .all(|entry| entry.direction == Direction::Sent));
    }

    #[tokio::test]
    async fn cancellation_stops_workers_and_count_is_exact() {
        let (broker, published) = stub_broker(None);
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let (broadcaster, _history, _events) = broadcaster(broker, stats);

        let mut big = job(100_000, 4, vec!["a"]);
        big.interval = Duration::from_millis(10);
        let handle = broadcaster.start(big).unwrap();

        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.cancel();
        let summary = handle.join().await;

        assert_eq!(summary.outcome, JobOutcome::Cancelled);
        assert!(summary.sent < 100_000);
        assert_eq!(summary.sent, published.load(Ordering::SeqCst));

        // No worker sends anything once the job reports stopped.
        let after_join = published.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(published.load(Ordering::SeqCst), after_join);
    }

    #[tokio::test]
    async fn connection_drop_fails_job_and_keeps_partial_progress() {
        let (broker, published) = stub_broker(Some(4));
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let (broadcaster, _history, _events) = broadcaster(broker, stats.clone());

        let handle = broadcaster.start(job(10, 1, vec!["a"])).unwrap();
        let summary = handle.join().await;

        assert_eq!(summary.outcome, JobOutcome::Failed);
        assert_eq!(summary.sent, 4);
        assert_eq!(published.load(Ordering::SeqCst), 4);
        assert_eq!(stats.snapshot()["a"].sent, 4);
    }

    #[tokio::test]
    async fn rejected_publishes_do_not_abort_the_job() {
        // Stub that rejects every second publish.
        let (commands, mut rx) = mpsc::channel(64);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        tokio::spawn(async move {
            let mut n = 0u64;
            while let Some(cmd) = rx.recv().await {
                if let BrokerCommand::Publish { respond, .. } = cmd {
                    n += 1;
                    let result = if n % 2 == 0 {
                        Err(PublishError::Rejected("broker said no".to_string()))
                    } else {
                        Ok(())
                    };
                    let _ = respond.send(result);
                }
            }
        });
        let broker = BrokerHandle::from_parts(commands, state_rx);
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let (broadcaster, _history, _events) = broadcaster(broker, stats);

        let handle = broadcaster.start(job(10, 1, vec!["a"])).unwrap();
        let summary = handle.join().await;

        assert_eq!(summary.outcome, JobOutcome::Completed);
        assert_eq!(summary.sent, 5);
        assert_eq!(summary.failed, 5);
    }

    #[tokio::test]
    async fn progress_is_reported_periodically_then_finished() {
        let (broker, _published) = stub_broker(None);
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let (broadcaster, _history, mut events) = broadcaster(broker, stats);

        let mut slow = job(30, 2, vec!["a"]);
        slow.interval = Duration::from_millis(5);
        let handle = broadcaster.start(slow).unwrap();

        let mut saw_progress = false;
        loop {
            match events.recv().await {
                Some(JobEvent::Progress { .. }) => saw_progress = true,
                Some(JobEvent::Finished(summary)) => {
                    assert_eq!(summary.sent, 30);
                    break;
                }
                None => panic!("event channel closed before the job finished"),
            }
        }
        assert!(saw_progress, "expected at least one progress tick");
        handle.join().await;
    }

    #[tokio::test]
    async fn empty_target_set_is_rejected() {
        let (broker, _published) = stub_broker(None);
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let (broadcaster, _history, _events) = broadcaster(broker, stats);

        let mut no_targets = job(10, 1, vec![]);
        no_targets.targets = TargetSet::Channels(Vec::new());
        assert!(matches!(
            broadcaster.start(no_targets),
            Err(BroadcastError::NoTargets)
        ));

        let all_known = BroadcastJob {
            targets: TargetSet::AllKnown,
            ..job(10, 1, vec![])
        };
        // Nothing has been seen yet, so "all known channels" is empty too.
        assert!(matches!(
            broadcaster.start(all_known),
            Err(BroadcastError::NoTargets)
        ));
    }

    #[tokio::test]
    async fn zero_count_is_rejected() {
        let (broker, _published) = stub_broker(None);
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        let (broadcaster, _history, _events) = broadcaster(broker, stats);

        assert!(matches!(
            broadcaster.start(job(0, 1, vec!["a"])),
            Err(BroadcastError::ZeroCount)
        ));
    }

    #[tokio::test]
    async fn all_known_targets_resolve_from_statistics() {
        let (broker, published) = stub_broker(None);
        let stats = Arc::new(StatsStore::new(Duration::from_secs(60)));
        stats.record_received("seen/one");
        stats.record_received("seen/two");
        let (broadcaster, _history, _events) = broadcaster(broker, stats.clone());

        let all = BroadcastJob {
            targets: TargetSet::AllKnown,
            ..job(4, 2, vec![])
        };
        let summary = broadcaster.start(all).unwrap().join().await;

        assert_eq!(summary.outcome, JobOutcome::Completed);
        assert_eq!(summary.sent, 4);
        assert_eq!(published.load(Ordering::SeqCst), 4);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot["seen/one"].sent + snapshot["seen/two"].sent, 4);
    }
}
