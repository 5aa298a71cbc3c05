//! Dispatcher
//!
//! One send attempt per call:
//! 1. channel dispatch disabled -> `Skipped(DispatchDisabled)`
//! 2. throttler denies -> `Failed(Throttled)`, the caller decides what to do
//! 3. filter rejects -> `Skipped(Filtered)`, no network call
//! 4. transform, then encrypt when the channel has a key
//! 5. a single POST to the channel target
//!
//! A failed `send` is persisted to the retry store. Throttled attempts are not:
//! they were never tried and the caller still owns the payload.

use crate::content::{AesGcmCipher, Cipher, Filter, Transformer};
use crate::relay_metrics;
use crate::report::{NoopReporter, Reporter};
use crate::retry_store::RetryStore;
use crate::throttle::Throttler;
use crate::transport::Transport;
use bl_common::{DispatchFailure, DispatchOutcome, OutgoingMessage, RetryRecord, SkipReason};
use bl_config::ChannelRegistry;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    throttler: Arc<Throttler>,
    transport: Arc<dyn Transport>,
    retry_store: Arc<dyn RetryStore>,
    reporter: Arc<dyn Reporter>,
    filter: Option<Arc<dyn Filter>>,
    transformer: Option<Arc<dyn Transformer>>,
    cipher: Arc<dyn Cipher>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        transport: Arc<dyn Transport>,
        retry_store: Arc<dyn RetryStore>,
    ) -> Self {
        Self {
            registry,
            throttler: Arc::new(Throttler::new()),
            transport,
            retry_store,
            reporter: Arc::new(NoopReporter),
            filter: None,
            transformer: None,
            cipher: Arc::new(AesGcmCipher::new()),
        }
    }

    pub fn with_throttler(mut self, throttler: Arc<Throttler>) -> Self {
        self.throttler = throttler;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    pub fn retry_store(&self) -> &Arc<dyn RetryStore> {
        &self.retry_store
    }

    /// Send a payload, persisting a retry record if it fails
    pub async fn send(&self, channel: &str, payload: &str) -> DispatchOutcome {
        self.deliver(channel, payload, None, 1, true).await
    }

    /// Send a queued message; its id is carried into the status trail
    pub async fn send_message(&self, message: &OutgoingMessage) -> DispatchOutcome {
        self.deliver(
            &message.channel,
            &message.payload,
            Some(&message.id),
            message.entries,
            true,
        )
        .await
    }

    /// Resend a stored record. Nothing new is persisted; the record stays where it is.
    pub async fn retry(&self, record: &RetryRecord) -> DispatchOutcome {
        self.deliver(
            &record.channel,
            &record.payload,
            Some(&record.id),
            record.entries,
            false,
        )
        .await
    }

    async fn deliver(
        &self,
        channel: &str,
        payload: &str,
        id: Option<&str>,
        entries: u64,
        persist_on_failure: bool,
    ) -> DispatchOutcome {
        let outcome = self.attempt(channel, payload).await;
        relay_metrics::record_dispatch(channel, outcome.label());

        match &outcome {
            DispatchOutcome::Sent { bytes } => {
                debug!(channel, bytes, "Payload sent");
                self.reporter.record_outgoing(entries, *bytes as u64);
                self.reporter.write_status(channel, id, entries, outcome.status());
            }
            DispatchOutcome::Skipped { reason } => {
                debug!(channel, %reason, "Dispatch skipped");
                self.reporter.write_status(channel, id, entries, outcome.status());
            }
            DispatchOutcome::Failed {
                cause: DispatchFailure::Throttled,
            } => {
                relay_metrics::record_throttled(channel);
                debug!(channel, "Dispatch throttled");
            }
            DispatchOutcome::Failed { cause } => {
                warn!(channel, error = %cause, "Dispatch failed");
                if persist_on_failure {
                    self.persist(channel, payload, entries).await;
                }
                self.reporter.write_status(channel, id, entries, outcome.status());
            }
        }
        outcome
    }

    async fn attempt(&self, channel: &str, payload: &str) -> DispatchOutcome {
        let config = self.registry.snapshot(channel);
        if !config.dispatch_enabled {
            return DispatchOutcome::Skipped {
                reason: SkipReason::DispatchDisabled,
            };
        }

        if !self.throttler.admit(&config) {
            return DispatchOutcome::failed(DispatchFailure::Throttled);
        }

        if let Some(filter) = &self.filter {
            if !filter.accept(channel, payload) {
                return DispatchOutcome::Skipped {
                    reason: SkipReason::Filtered,
                };
            }
        }

        let mut body = payload.to_string();
        if let Some(transformer) = &self.transformer {
            body = match transformer.apply(channel, body) {
                Ok(body) => body,
                Err(e) => return DispatchOutcome::failed(DispatchFailure::Content(e.to_string())),
            };
        }
        if let Some(key) = &config.encryption_key {
            body = match self.cipher.encrypt(&body, key) {
                Ok(body) => body,
                Err(e) => return DispatchOutcome::failed(DispatchFailure::Content(e.to_string())),
            };
        }

        let bytes = body.len();
        let started = Instant::now();
        let result = self.transport.post(&config.target_url, body).await;
        relay_metrics::record_dispatch_duration(channel, started.elapsed());

        match result {
            Ok(()) => DispatchOutcome::Sent { bytes },
            Err(cause) => DispatchOutcome::failed(cause),
        }
    }

    /// Hand a failed payload to the retry store. Logged loudly if the store refuses it.
    pub async fn persist(&self, channel: &str, payload: &str, entries: u64) {
        let record = RetryRecord::new(channel, payload).with_entries(entries);
        if let Err(e) = self.retry_store.save(&record).await {
            error!(
                channel,
                id = %record.id,
                error = %e,
                "Failed to persist retry record, payload may be lost"
            );
        }
    }
}
