//! Retry Sweeper
//!
//! Periodically replays every stored retry record through the dispatcher and
//! deletes the ones that were sent. Anything else stays for the next sweep.

use crate::dispatcher::Dispatcher;
use crate::relay_metrics;
use crate::retry_store::RetryStore;
use bl_common::{DispatchOutcome, RetryRecord};
use bl_config::BackoffConfig;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub listed: usize,
    pub attempted: usize,
    pub sent: usize,
    pub retained: usize,
    /// Records not yet due under retry backoff
    pub deferred: usize,
}

pub struct RetrySweeper {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn RetryStore>,
    backoff: BackoffConfig,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetrySweeper {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<dyn RetryStore>) -> Self {
        Self {
            dispatcher,
            store,
            backoff: BackoffConfig::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sweep on `period` until `cancel` fires
    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        info!(interval_secs = period.as_secs(), "Starting retry sweeper");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; records left from a previous run go out at startup

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = cancel.cancelled() => {
                    info!("Retry sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Run one sweep. Returns `None` when another sweep is still in progress.
    pub async fn sweep_once(&self) -> Option<SweepStats> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Retry sweep already running, skipping");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list retry records");
                return Some(SweepStats::default());
            }
        };

        let mut stats = SweepStats {
            listed: records.len(),
            ..Default::default()
        };

        for record in records {
            if !self.is_due(&record) {
                stats.deferred += 1;
                continue;
            }
            stats.attempted += 1;
            match self.dispatcher.retry(&record).await {
                DispatchOutcome::Sent { .. } => {
                    stats.sent += 1;
                    if let Err(e) = self.store.delete(&record.id).await {
                        // Stays in the store and will be sent again next sweep
                        error!(id = %record.id, channel = %record.channel, error = %e, "Failed to delete sent retry record");
                    }
                }
                DispatchOutcome::Failed { .. } => {
                    stats.retained += 1;
                    self.note_failed_attempt(record).await;
                }
                DispatchOutcome::Skipped { reason } => {
                    stats.retained += 1;
                    debug!(id = %record.id, channel = %record.channel, %reason, "Retry skipped, record kept");
                }
            }
        }

        let pending = stats.listed - stats.sent;
        relay_metrics::set_retry_records_pending(pending);
        if stats.attempted > 0 {
            info!(
                attempted = stats.attempted,
                sent = stats.sent,
                retained = stats.retained,
                deferred = stats.deferred,
                "Retry sweep complete"
            );
        }
        Some(stats)
    }

    fn is_due(&self, record: &RetryRecord) -> bool {
        let Some(delay) = self.backoff.delay_for(record.attempts) else {
            return true;
        };
        let last = record.last_attempt_at.unwrap_or(record.failed_at);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => Utc::now() >= last + delay,
            Err(_) => true,
        }
    }

    async fn note_failed_attempt(&self, mut record: RetryRecord) {
        if !self.backoff.enabled {
            return;
        }
        record.record_attempt(Utc::now());
        if let Err(e) = self.store.save(&record).await {
            warn!(id = %record.id, error = %e, "Failed to update retry attempt count");
        }
    }
}
