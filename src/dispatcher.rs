use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::DeterrentError;
use crate::messages::{AlertChannelResult, AlertEvent, DispatchStats};
use crate::services::{AlertChannel, ChannelType};

/// Fans one triggered alert out to every side-channel as independent tasks.
///
/// Called from the blocking loop thread. Tasks run on the given runtime, each bounded by
/// `channel_timeout`, and are tracked in a `JoinSet` so every completion is logged and counted.
pub struct AlertDispatcher {
    channels: Vec<ChannelType>,
    runtime: Handle,
    channel_timeout: Duration,
    tasks: JoinSet<AlertChannelResult>,
    stats: DispatchStats,
}

impl AlertDispatcher {
    pub fn new(channels: Vec<ChannelType>, runtime: Handle, channel_timeout: Duration) -> Self {
        Self {
            channels,
            runtime,
            channel_timeout,
            tasks: JoinSet::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Starts one task per channel and returns without waiting for any of them.
    pub fn dispatch(&mut self, alert: AlertEvent) {
        let alert = Arc::new(alert);
        for channel in &self.channels {
            let task = deliver(channel.clone(), alert.clone(), self.channel_timeout);
            self.tasks.spawn_on(task, &self.runtime);
            self.stats.dispatched += 1;
        }
        debug!(
            target: "dispatch",
            "Alert #{} handed to {} channels",
            alert.sequence,
            self.channels.len()
        );
    }

    /// Collects finished tasks without blocking.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            record(&mut self.stats, result);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Waits up to `grace` for outstanding tasks, then aborts whatever is left.
    /// Must not be called from inside the runtime's async context.
    pub fn drain(&mut self, grace: Duration) -> DispatchStats {
        self.reap();
        if self.tasks.is_empty() {
            return self.stats;
        }

        info!(
            target: "dispatch",
            "Waiting up to {:?} for {} side-channel tasks",
            grace,
            self.tasks.len()
        );
        let tasks = &mut self.tasks;
        let stats = &mut self.stats;
        let finished = self.runtime.block_on(async {
            tokio::time::timeout(grace, async {
                while let Some(result) = tasks.join_next().await {
                    record(stats, result);
                }
            })
            .await
        });

        if finished.is_err() {
            let remaining = self.tasks.len() as u64;
            warn!(
                target: "dispatch",
                "Abandoning {} side-channel tasks after {:?} grace period",
                remaining,
                grace
            );
            self.stats.abandoned += remaining;
            self.tasks.abort_all();
            self.tasks.detach_all();
        }

        self.stats
    }
}

async fn deliver(
    channel: ChannelType,
    alert: Arc<AlertEvent>,
    limit: Duration,
) -> AlertChannelResult {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(limit, channel.deliver(&alert)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(DeterrentError::ChannelTimeout {
            channel: channel.name(),
            seconds: limit.as_secs(),
        }),
    };

    let result = AlertChannelResult {
        channel: channel.name(),
        sequence: alert.sequence,
        label: alert.detection.label.clone(),
        success: outcome.is_ok(),
        error_message: outcome.err().map(|err| err.to_string()),
        elapsed: started.elapsed(),
    };

    match &result.error_message {
        None => info!(
            target: "dispatch",
            "{} channel finished alert #{} ({}) in {:?}",
            result.channel, result.sequence, result.label, result.elapsed
        ),
        Some(reason) => error!(
            target: "dispatch",
            "{} channel failed alert #{} ({}, {}) after {:?}: {}",
            result.channel,
            result.sequence,
            result.label,
            alert.detection.frame_timestamp.format("%Y-%m-%d %H:%M:%S"),
            result.elapsed,
            reason
        ),
    }

    result
}

fn record(stats: &mut DispatchStats, result: Result<AlertChannelResult, JoinError>) {
    match result {
        Ok(result) if result.success => stats.succeeded += 1,
        Ok(_) => stats.failed += 1,
        Err(err) if err.is_cancelled() => stats.abandoned += 1,
        Err(err) => {
            error!(target: "dispatch", "Side-channel task panicked: {}", err);
            stats.failed += 1;
        }
    }
}
