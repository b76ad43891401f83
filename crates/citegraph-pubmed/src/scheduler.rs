use std::sync::Arc;
use std::time::Duration;

use citegraph_core::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::pipeline::CompletionPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Passes per tick.
    pub repeat_count: u32,
}

impl Schedule {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            interval: Duration::from_millis(config.interval_ms),
            repeat_count: config.repeat_count,
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Handle to a background completion loop.
///
/// Cancelling stops future ticks; a tick already running its passes finishes
/// first. Ticks that find the pipeline busy are skipped.
pub struct ScheduledCompletion {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledCompletion {
    /// Must be called within a tokio runtime.
    pub fn start(pipeline: Arc<CompletionPipeline>, schedule: Schedule) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_schedule(pipeline, schedule, cancel_rx));
        Self { cancel_tx, handle }
    }

    pub fn cancel(&self) {
        // Err only means the loop already exited.
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel();
        if let Err(e) = self.handle.await {
            warn!("completion scheduler task failed: {e}");
        }
    }
}

async fn run_schedule(
    pipeline: Arc<CompletionPipeline>,
    schedule: Schedule,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let period = schedule.interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + schedule.initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        initial_delay_ms = schedule.initial_delay.as_millis() as u64,
        interval_ms = period.as_millis() as u64,
        repeat = schedule.repeat_count,
        "completion scheduler started"
    );

    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match pipeline.try_run_repeated(schedule.repeat_count).await {
                    Ok(Some(reports)) => {
                        let merged: usize = reports.iter().map(|r| r.merged).sum();
                        debug!(passes = reports.len(), merged, "scheduled completion tick");
                    }
                    Ok(None) => debug!("completion already running, tick skipped"),
                    Err(e) => warn!("scheduled completion failed, retrying next tick: {e}"),
                }
            }
        }
    }
    info!("completion scheduler stopped");
}
