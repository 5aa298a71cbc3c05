//! Relay - the running engine
//!
//! Wires ingestion to buckets, flushes to the outgoing queue or straight to the
//! dispatcher, and owns every background task:
//! - one bucket sweep ticker per channel
//! - dispatch workers draining the outgoing queue
//! - the queue snapshot ticker
//! - the retry sweeper
//! - the config reloader, when started
//!
//! All tasks hang off one cancellation token per stage so shutdown can stop
//! them in order. Throttled queue messages are parked per channel instead of
//! holding a worker, so one rate-limited channel never stalls the others.

use crate::archive::{Archiver, FileArchiver, FileArchiverConfig, NoopArchiver};
use crate::bucket::{extract_group_key, Batch, BucketManager};
use crate::content::{Cipher, Filter, Transformer};
use crate::dispatcher::Dispatcher;
use crate::merge::Merger;
use crate::parked::ParkedMessages;
use crate::relay_metrics;
use crate::report::{CsvReporter, NoopReporter, Reporter};
use crate::retry_store::{FileRetryStore, RetryStore};
use crate::sweeper::RetrySweeper;
use crate::throttle::Throttler;
use crate::transport::{HttpTransport, Transport};
use crate::{RelayError, Result};
use bl_common::OutgoingMessage;
use bl_config::{AppConfig, ChannelConfig, ChannelDiff, ChannelRegistry, DispatchMode, EngineConfig, RetryConfig};
use bl_queue::{OutgoingQueue, SnapshotStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Point-in-time view of the engine, served by the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub accepting: bool,
    pub open_buckets: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    /// Throttled messages waiting for their channel's next window
    pub parked: usize,
    /// `None` when the retry store could not be read
    pub pending_retries: Option<usize>,
    pub channels: usize,
}

/// Builder for [`Relay`]. Transport and retry store are required; everything
/// else has a quiet default.
pub struct RelayBuilder {
    registry: Arc<ChannelRegistry>,
    transport: Arc<dyn Transport>,
    retry_store: Arc<dyn RetryStore>,
    engine: EngineConfig,
    retry: RetryConfig,
    snapshot_store: Option<SnapshotStore>,
    archiver: Arc<dyn Archiver>,
    reporter: Arc<dyn Reporter>,
    filter: Option<Arc<dyn Filter>>,
    transformer: Option<Arc<dyn Transformer>>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl RelayBuilder {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        transport: Arc<dyn Transport>,
        retry_store: Arc<dyn RetryStore>,
    ) -> Self {
        Self {
            registry,
            transport,
            retry_store,
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
            snapshot_store: None,
            archiver: Arc::new(NoopArchiver),
            reporter: Arc::new(NoopReporter),
            filter: None,
            transformer: None,
            cipher: None,
        }
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn build(self) -> Arc<Relay> {
        let mut dispatcher = Dispatcher::new(
            self.registry.clone(),
            self.transport,
            self.retry_store.clone(),
        )
        .with_throttler(Arc::new(Throttler::new()))
        .with_reporter(self.reporter.clone());
        if let Some(filter) = self.filter {
            dispatcher = dispatcher.with_filter(filter);
        }
        if let Some(transformer) = self.transformer {
            dispatcher = dispatcher.with_transformer(transformer);
        }
        if let Some(cipher) = self.cipher {
            dispatcher = dispatcher.with_cipher(cipher);
        }
        let dispatcher = Arc::new(dispatcher);

        let sweeper = Arc::new(
            RetrySweeper::new(dispatcher.clone(), self.retry_store)
                .with_backoff(self.retry.backoff.clone()),
        );
        let workers = self.engine.dispatch_workers.max(1);

        Arc::new(Relay {
            registry: self.registry,
            engine: self.engine,
            retry: self.retry,
            buckets: BucketManager::new(),
            merger: Merger::new(),
            queue: Arc::new(OutgoingQueue::new()),
            parked: ParkedMessages::new(),
            snapshot_store: self.snapshot_store,
            dispatcher,
            sweeper,
            archiver: self.archiver,
            reporter: self.reporter,
            accepting: RwLock::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            tickers: CancellationToken::new(),
            workers: CancellationToken::new(),
            direct_permits: Arc::new(Semaphore::new(workers)),
            direct_tasks: TaskTracker::new(),
            sweep_tickers: DashMap::new(),
            ticker_handles: Mutex::new(Vec::new()),
            worker_handles: Mutex::new(Vec::new()),
        })
    }
}

pub struct Relay {
    registry: Arc<ChannelRegistry>,
    engine: EngineConfig,
    retry: RetryConfig,
    buckets: BucketManager,
    merger: Merger,
    queue: Arc<OutgoingQueue>,
    /// Throttled queue messages waiting for their channel's next window
    parked: ParkedMessages,
    snapshot_store: Option<SnapshotStore>,
    dispatcher: Arc<Dispatcher>,
    sweeper: Arc<RetrySweeper>,
    archiver: Arc<dyn Archiver>,
    reporter: Arc<dyn Reporter>,

    /// Held shared by `ingest` from the check through the append; shutdown
    /// takes it exclusively to stop intake before draining buckets
    accepting: RwLock<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Queued messages taken by a worker and not yet settled
    in_flight: AtomicUsize,

    tickers: CancellationToken,
    workers: CancellationToken,
    direct_permits: Arc<Semaphore>,
    direct_tasks: TaskTracker,
    sweep_tickers: DashMap<String, CancellationToken>,
    ticker_handles: Mutex<Vec<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    pub fn builder(
        registry: Arc<ChannelRegistry>,
        transport: Arc<dyn Transport>,
        retry_store: Arc<dyn RetryStore>,
    ) -> RelayBuilder {
        RelayBuilder::new(registry, transport, retry_store)
    }

    /// Build a relay with the default file-backed leaves described by `config`
    pub async fn from_config(config: &AppConfig) -> Result<Arc<Self>> {
        let registry = Arc::new(ChannelRegistry::from_config(config));
        let transport = Arc::new(HttpTransport::new((&config.dispatch).into())?);
        let retry_store = Arc::new(FileRetryStore::open(config.retry_dir()).await?);

        let archiver: Arc<dyn Archiver> = if config.storage.archive_enabled {
            Arc::new(FileArchiver::start(FileArchiverConfig::new(config.archive_dir())))
        } else {
            Arc::new(NoopArchiver)
        };
        let reporter: Arc<dyn Reporter> = if config.storage.report_enabled {
            Arc::new(CsvReporter::start(config.report_dir()))
        } else {
            Arc::new(NoopReporter)
        };

        Ok(RelayBuilder::new(registry, transport, retry_store)
            .engine(config.engine.clone())
            .retry(config.retry.clone())
            .snapshot_store(SnapshotStore::new(config.queue_snapshot_dir()))
            .archiver(archiver)
            .reporter(reporter)
            .build())
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sweeper(&self) -> &Arc<RetrySweeper> {
        &self.sweeper
    }

    pub fn queue(&self) -> &Arc<OutgoingQueue> {
        &self.queue
    }

    pub fn buckets(&self) -> &BucketManager {
        &self.buckets
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.read()
    }

    /// Throttled messages waiting for their channel's next window
    pub fn parked_messages(&self) -> usize {
        self.parked.len()
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Rehydrate the queue, then start workers and tickers and begin accepting entries
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(store) = &self.snapshot_store {
            let restored = store.load().await?;
            let count = self.queue.rehydrate(restored);
            if count > 0 {
                info!(restored = count, "Rehydrated outgoing queue from snapshot");
            }
        }

        let workers = self.engine.dispatch_workers.max(1);
        {
            let mut handles = self.worker_handles.lock();
            for worker_id in 0..workers {
                let relay = self.clone();
                handles.push(tokio::spawn(async move { relay.worker_loop(worker_id).await }));
            }
        }

        let channels = self.registry.channel_names();
        for channel in &channels {
            self.spawn_sweep_ticker(channel.clone());
        }

        if self.snapshot_store.is_some() {
            self.spawn_snapshot_ticker();
        }

        let sweeper = self.sweeper.clone();
        let retry_interval = self.retry.interval();
        let token = self.tickers.child_token();
        self.track(tokio::spawn(async move { sweeper.run(retry_interval, token).await }));

        *self.accepting.write() = true;
        info!(workers, channels = channels.len(), "Relay started");
        Ok(())
    }

    pub(crate) fn ticker_token(&self) -> CancellationToken {
        self.tickers.child_token()
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.ticker_handles.lock().push(handle);
    }

    fn spawn_sweep_ticker(self: &Arc<Self>, channel: String) {
        let token = match self.sweep_tickers.entry(channel.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                let token = self.tickers.child_token();
                vacant.insert(token.clone());
                token
            }
        };

        let relay = self.clone();
        let period = self.engine.sweep_interval();
        self.track(tokio::spawn(async move {
            debug!(channel = %channel, interval_ms = period.as_millis() as u64, "Starting sweep ticker");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        relay.sweep_channel(&channel);
                    }
                    _ = token.cancelled() => {
                        debug!(channel = %channel, "Sweep ticker stopped");
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_snapshot_ticker(self: &Arc<Self>) {
        let relay = self.clone();
        let period = self.engine.snapshot_interval();
        let token = self.tickers.child_token();
        self.track(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = relay.snapshot_queue().await {
                            error!(error = %e, "Queue snapshot failed");
                        }
                    }
                    _ = token.cancelled() => {
                        info!("Queue snapshot ticker shutting down");
                        break;
                    }
                }
            }
        }));
    }

    // ========================================================================
    // Ingestion and flush
    // ========================================================================

    /// Accept one raw JSON entry for `channel`. Never waits on network I/O.
    pub fn ingest(self: &Arc<Self>, channel: &str, raw: &str) -> Result<()> {
        let accepting = self.accepting.read();
        if !*accepting {
            return Err(RelayError::NotAccepting);
        }
        if !self.registry.contains(channel) {
            warn!(channel, "Discarding entry for unknown channel");
            return Err(RelayError::UnknownChannel(channel.to_string()));
        }

        let config = self.registry.snapshot(channel);
        let entry = raw.trim();
        if config.archive_enabled {
            self.archiver.archive_incoming(channel, entry);
        }

        let group = match extract_group_key(&config, entry) {
            Ok(group) => group,
            Err(e) => {
                relay_metrics::record_entry_malformed(channel);
                warn!(channel, error = %e, "Discarding malformed entry");
                return Err(e);
            }
        };

        relay_metrics::record_entry_ingested(channel);
        if let Some(batch) = self.buckets.append(&config, group, entry.to_string()) {
            self.flush(&config, batch);
        }
        drop(accepting);
        Ok(())
    }

    /// Flush every bucket of `channel` that has outlived its window. Returns the count.
    pub fn sweep_channel(self: &Arc<Self>, channel: &str) -> usize {
        let config = self.registry.snapshot(channel);
        let batches = self.buckets.sweep(channel, config.window());
        let flushed = batches.len();
        for batch in batches {
            self.flush(&config, batch);
        }
        if flushed > 0 {
            info!(channel, flushed, "Sweep flushed buckets");
        }
        relay_metrics::set_open_buckets(self.buckets.open_buckets());
        flushed
    }

    fn flush(self: &Arc<Self>, config: &ChannelConfig, batch: Batch) {
        relay_metrics::record_flush(&batch.channel, batch.trigger.as_str(), batch.len());
        let entries = batch.len() as u64;
        let payload = self.merger.merge(config, &batch);
        if config.archive_enabled {
            self.archiver.archive_merged(&batch.channel, &payload);
        }
        debug!(
            channel = %batch.channel,
            group = %batch.group,
            entries = batch.len(),
            trigger = batch.trigger.as_str(),
            "Bucket flushed"
        );

        let message =
            OutgoingMessage::new(batch.channel, payload, config.priority).with_entries(entries);
        match config.dispatch_mode {
            DispatchMode::Queued => {
                self.queue.offer(message);
                relay_metrics::set_queue_depth(self.queue.len());
            }
            DispatchMode::Direct => self.dispatch_direct(message),
        }
    }

    fn dispatch_direct(self: &Arc<Self>, message: OutgoingMessage) {
        let relay = self.clone();
        self.direct_tasks.spawn(async move {
            let _permit = match relay.direct_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    relay
                        .dispatcher
                        .persist(&message.channel, &message.payload, message.entries)
                        .await;
                    return;
                }
            };
            let outcome = relay.dispatcher.send_message(&message).await;
            if outcome.is_throttled() {
                // No queue to go back to; the retry sweeper picks it up
                debug!(channel = %message.channel, "Direct dispatch throttled, handing to retry store");
                relay
                    .dispatcher
                    .persist(&message.channel, &message.payload, message.entries)
                    .await;
            }
        });
    }

    // ========================================================================
    // Dispatch workers
    // ========================================================================

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Dispatch worker started");
        let poll_timeout = self.engine.poll_timeout();

        loop {
            self.release_parked();
            let wait = match self.parked.next_release() {
                Some(at) => at.saturating_duration_since(Instant::now()).min(poll_timeout),
                None => poll_timeout,
            };

            let message = tokio::select! {
                biased;
                _ = self.workers.cancelled() => break,
                message = self.queue.poll(wait) => message,
            };
            let Some(message) = message else {
                if self.workers.is_cancelled() {
                    break;
                }
                continue;
            };

            self.in_flight.fetch_add(1, Ordering::AcqRel);
            self.dispatch_queued(message).await;
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            relay_metrics::set_queue_depth(self.queue.len());
        }
        debug!(worker_id, "Dispatch worker stopped");
    }

    async fn dispatch_queued(&self, message: OutgoingMessage) {
        // A channel with parked messages is still over its limit
        let Some(message) = self.parked.park_behind(message) else {
            return;
        };

        let outcome = self.dispatcher.send_message(&message).await;
        if !outcome.is_throttled() {
            return;
        }

        let not_before = self
            .dispatcher
            .throttler()
            .window_end(&message.channel)
            .unwrap_or_else(|| Instant::now() + self.engine.throttle_backoff());
        debug!(channel = %message.channel, id = %message.id, "Parking throttled message until next window");
        self.parked.park(message, not_before);
    }

    /// Put messages whose channel window has opened back on the queue. They keep
    /// priority and enqueue time, so they return to their place.
    fn release_parked(&self) {
        let released = self.parked.release_due(Instant::now());
        if released.is_empty() {
            return;
        }
        debug!(released = released.len(), "Releasing parked messages");
        for message in released {
            self.queue.offer(message);
        }
    }

    // ========================================================================
    // Configuration changes
    // ========================================================================

    /// Swap in a new channel table, starting and stopping sweep tickers to match
    pub fn apply_channels(self: &Arc<Self>, channels: HashMap<String, Arc<ChannelConfig>>) -> ChannelDiff {
        let diff = self.registry.replace(channels);
        if diff.is_empty() {
            return diff;
        }

        if self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire) {
            for channel in &diff.added {
                self.spawn_sweep_ticker(channel.clone());
            }
        }
        for channel in &diff.removed {
            self.retire_channel(channel);
        }

        info!(
            added = ?diff.added,
            removed = ?diff.removed,
            changed = ?diff.changed,
            "Channel configuration updated"
        );
        diff
    }

    fn retire_channel(self: &Arc<Self>, channel: &str) {
        if let Some((_, token)) = self.sweep_tickers.remove(channel) {
            token.cancel();
        }
        self.dispatcher.throttler().remove(channel);
        for message in self.parked.release_channel(channel) {
            self.queue.offer(message);
        }

        // Whatever is still buffered goes out under the channel's new (disabled) settings
        let config = self.registry.snapshot(channel);
        let batches = self.buckets.sweep(channel, Duration::ZERO);
        if !batches.is_empty() {
            warn!(channel, buckets = batches.len(), "Channel removed, flushing its open buckets");
        }
        for batch in batches {
            self.flush(&config, batch);
        }
    }

    // ========================================================================
    // Snapshot, stats and shutdown
    // ========================================================================

    /// Write the current queue contents to the snapshot store
    pub async fn snapshot_queue(&self) -> Result<usize> {
        let Some(store) = &self.snapshot_store else {
            return Ok(0);
        };
        let mut messages = self.queue.snapshot();
        messages.extend(self.parked.snapshot());
        let written = store.save(&messages).await?;
        relay_metrics::set_queue_depth(written);
        debug!(written, "Outgoing queue snapshotted");
        Ok(written)
    }

    pub async fn stats(&self) -> RelayStats {
        let pending_retries = match self.dispatcher.retry_store().count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to count retry records");
                None
            }
        };
        RelayStats {
            accepting: self.is_accepting(),
            open_buckets: self.buckets.open_buckets(),
            queue_depth: self.queue.len(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            parked: self.parked.len(),
            pending_retries,
            channels: self.registry.len(),
        }
    }

    async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.is_empty()
                && self.parked.is_empty()
                && self.in_flight.load(Ordering::Acquire) == 0
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Stop accepting, flush open buckets once, drain and snapshot the queue,
    /// then stop workers and close the side-effect leaves. Safe to call twice.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let drain_timeout = self.engine.drain_timeout();
        info!("Relay shutting down");

        // 1. Stop accepting new entries; waits out any ingest already past the check
        *self.accepting.write() = false;

        // 2. Stop tickers (sweeps, snapshots, retry sweeper, reloader)
        self.tickers.cancel();
        let tickers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.ticker_handles.lock());
        if tokio::time::timeout(drain_timeout, join_all(tickers)).await.is_err() {
            warn!("Background tasks did not stop within drain timeout");
        }

        // 3. Flush every open bucket once
        let batches = self.buckets.drain_all();
        let flushed = batches.len();
        for batch in batches {
            let config = self.registry.snapshot(&batch.channel);
            self.flush(&config, batch);
        }
        if flushed > 0 {
            info!(flushed, "Flushed open buckets");
        }

        // 4. Let workers drain the queue
        let started = self.started.load(Ordering::Acquire);
        if started && !self.wait_for_drain(drain_timeout).await {
            warn!(remaining = self.queue.len(), "Queue not drained within timeout, remaining messages will be snapshotted");
        }

        // 5. Stop workers; each finishes the message it holds
        self.workers.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.worker_handles.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Dispatch worker panicked");
            }
        }

        // 6. Persist whatever is left, parked messages included
        for message in self.parked.release_all() {
            self.queue.offer(message);
        }
        match self.snapshot_queue().await {
            Ok(0) => {}
            Ok(written) => info!(written, "Snapshotted undelivered queue messages"),
            Err(e) => error!(error = %e, remaining = self.queue.len(), "Final queue snapshot failed"),
        }
        if self.snapshot_store.is_none() && !self.queue.is_empty() {
            warn!(remaining = self.queue.len(), "No snapshot store configured, queued messages dropped");
        }

        // 7. Wait for direct dispatches
        self.direct_tasks.close();
        if tokio::time::timeout(drain_timeout, self.direct_tasks.wait()).await.is_err() {
            warn!(remaining = self.direct_tasks.len(), "Direct dispatches still running after drain timeout");
        }

        // 8. Close side-effect writers
        self.archiver.close().await;
        self.reporter.close().await;

        info!("Relay shutdown complete");
    }
}
