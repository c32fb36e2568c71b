//! Background retry sweep.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::runner::JobRunner;

/// Default pause between retry sweeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poller runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RetryPollerStats {
    pub sweeps: u64,
    pub jobs_attempted: u64,
    pub sweep_errors: u64,
    pub uptime_secs: u64,
}

/// Handle to a running retry poller.
pub struct RetryPollerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<RetryPollerStats>>,
    started: Instant,
}

impl RetryPollerHandle {
    /// Stop the poller and wait for the in-flight sweep to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "retry poller task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    pub fn stats(&self) -> RetryPollerStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Periodically calls [`JobRunner::process_retry_jobs`].
pub struct RetryPoller {
    runner: Arc<JobRunner>,
    interval: Duration,
}

impl RetryPoller {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self {
            runner,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Start the sweep loop on the current runtime.
    ///
    /// The first sweep runs immediately. Cancelling `cancel` (or calling
    /// [`RetryPollerHandle::shutdown`]) stops the loop between sweeps.
    pub fn spawn(self, cancel: CancellationToken) -> RetryPollerHandle {
        let stats = Arc::new(Mutex::new(RetryPollerStats::default()));
        let task_stats = stats.clone();
        let task_cancel = cancel.clone();
        let RetryPoller { runner, interval: period } = self;

        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_ms = period.as_millis() as u64, "retry poller started");

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        info!("retry poller shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = runner.process_retry_jobs().await;
                        let mut stats = match task_stats.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        stats.sweeps += 1;
                        match result {
                            Ok(attempted) => {
                                stats.jobs_attempted += attempted as u64;
                                debug!(attempted, "retry sweep completed");
                            }
                            Err(e) => {
                                stats.sweep_errors += 1;
                                error!(error = %e, "retry sweep failed");
                            }
                        }
                    }
                }
            }
        });

        RetryPollerHandle {
            cancel,
            join: Some(join),
            stats,
            started: Instant::now(),
        }
    }
}
