use std::time::Duration;

use rumqttc::QoS;

/// Upper bound on concurrent broadcast workers.
pub const MAX_WORKERS: usize = 16;

/// Channels a broadcast publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSet {
    /// An explicit list of channels, cycled through message by message.
    Channels(Vec<String>),
    /// Every channel the statistics store has seen so far.
    AllKnown,
}

/// One broadcast request. Immutable once started.
#[derive(Debug, Clone)]
pub struct BroadcastJob {
    pub template: String,
    pub targets: TargetSet,
    pub count: u64,
    pub interval: Duration,
    pub workers: usize,
    pub qos: QoS,
    pub retain: bool,
    /// Render message `i` of `n` as `"{template} ({i+1}/{n})"`.
    pub append_counter: bool,
}

impl BroadcastJob {
    pub fn clamped_workers(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    /// Splits `count` into one share per worker. Shares differ by at most
    /// one, the remainder goes to the first workers, and the shares always
    /// sum to exactly `count`.
    pub fn worker_shares(&self) -> Vec<u64> {
        let workers = self.clamped_workers() as u64;
        let base = self.count / workers;
        let remainder = self.count % workers;
        (0..workers)
            .map(|w| if w < remainder { base + 1 } else { base })
            .collect()
    }

    pub fn render_message(&self, index: u64) -> String {
        if self.append_counter {
            format!("{} ({}/{})", self.template, index + 1, self.count)
        } else {
            self.template.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: u64,
    pub outcome: JobOutcome,
    pub sent: u64,
    pub failed: u64,
}

/// Emitted by a running job towards the dispatcher.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress { id: u64, sent: u64, failed: u64 },
    Finished(JobSummary),
}
