//! Indexer framework
//!
//! Turns a stream of `BatchInfo` notifications into idempotent per-run
//! database writes. The framework owns run discovery, topic subscription,
//! tick buffering and the ack barrier; concrete indexers implement
//! [`BatchIndexer`] with their schema DDL and MERGE writes.
//!
//! The ack discipline is the heart of the at-least-once contract: a
//! `BatchInfo` message is acknowledged only after `flush_ticks` has returned
//! cleanly for every tick it contributed. Any failure leaves the claim in
//! place, and the message is redelivered once the claim times out.

pub mod buffer;
pub mod discovery;
pub mod environment;
pub mod metadata;
pub mod metadata_gate;
pub mod organism;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use thiserror::Error;

use self::buffer::TickBuffer;
use self::discovery::{DiscoveryError, RunDiscovery};
use crate::core::constants::INDEXER_RECEIVE_TIMEOUT_MS;
use crate::data::blobs::RunStore;
use crate::data::codec::CodecError;
use crate::data::error::{codes, DataError};
use crate::data::topics::{TopicError, TopicMessage, TopicReader};
use crate::services::monitor::ResourceMonitor;
use crate::services::{Service, ServiceCore, ServiceState};
use crate::utils::time::now_ms;
use crate::wire::{DecodedPayload, TickData, TickDataBatch};

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("indexer schema not prepared")]
    NotPrepared,
}

/// Hook interface implemented by concrete indexers.
///
/// Both methods run on blocking threads; `prepare_schema` MUST be idempotent
/// and `flush_ticks` MUST use MERGE semantics keyed on the natural
/// identifier so redelivery converges.
pub trait BatchIndexer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn prepare_schema(&self, run_id: &str) -> Result<(), IndexerError>;

    fn flush_ticks(&self, ticks: &[TickData]) -> Result<(), IndexerError>;
}

/// Framework tunables per indexer service.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub discovery: RunDiscovery,
    pub insert_batch_size: usize,
    pub flush_timeout: Duration,
}

/// Generic batch-consuming indexer service.
pub struct BatchIndexerService {
    core: ServiceCore,
    config: IndexerConfig,
    reader: Arc<TopicReader>,
    storage: Arc<dyn RunStore>,
    storage_monitor: Arc<ResourceMonitor>,
    indexer: Arc<dyn BatchIndexer>,
}

impl BatchIndexerService {
    pub fn new(
        name: impl Into<String>,
        config: IndexerConfig,
        reader: Arc<TopicReader>,
        storage: Arc<dyn RunStore>,
        storage_monitor: Arc<ResourceMonitor>,
        indexer: Arc<dyn BatchIndexer>,
    ) -> Self {
        Self {
            core: ServiceCore::new(name),
            config,
            reader,
            storage,
            storage_monitor,
            indexer,
        }
    }

    async fn run(self: Arc<Self>) {
        let started_at_ms = now_ms();
        let cancel = self.core.cancel_rx();

        let run_id = match self
            .config
            .discovery
            .discover(self.storage.as_ref(), started_at_ms, cancel.clone())
            .await
        {
            Ok(run_id) => run_id,
            Err(DiscoveryError::Cancelled) => {
                self.core.set_state(ServiceState::Stopped);
                return;
            }
            Err(e) => {
                tracing::error!(
                    service = %self.core.name(),
                    code = codes::DISCOVERY_TIMEOUT,
                    error = %e,
                    "Run discovery failed"
                );
                self.core.set_state(ServiceState::Error);
                return;
            }
        };

        if let Err(e) = self.bind_run(&run_id).await {
            tracing::error!(service = %self.core.name(), error = %e, "Run binding failed");
            self.core.set_state(ServiceState::Error);
            return;
        }

        self.consume_loop(cancel).await;
    }

    /// Bind the reader and prepare the per-run schema (blocking work).
    async fn bind_run(&self, run_id: &str) -> anyhow::Result<()> {
        let reader = Arc::clone(&self.reader);
        let indexer = Arc::clone(&self.indexer);
        let run_id = run_id.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            reader.set_simulation_run(&run_id)?;
            indexer.prepare_schema(&run_id)?;
            Ok(())
        })
        .await?
    }

    async fn consume_loop(self: &Arc<Self>, mut cancel: tokio::sync::watch::Receiver<bool>) {
        let mut buffer = TickBuffer::new(self.config.insert_batch_size, self.config.flush_timeout);
        let mut pending_acks: Vec<TopicMessage> = Vec::new();

        loop {
            self.core.wait_if_paused().await;
            if self.core.is_cancelled() {
                break;
            }

            let receive_timeout = buffer
                .time_to_deadline()
                .unwrap_or(Duration::from_millis(INDEXER_RECEIVE_TIMEOUT_MS))
                .min(Duration::from_millis(INDEXER_RECEIVE_TIMEOUT_MS));

            let received = tokio::select! {
                biased;
                _ = cancel.changed() => continue,
                received = self.reader.receive(receive_timeout) => received,
            };

            match received {
                Ok(Some(message)) => {
                    if !self.ingest(&message, &mut buffer, &mut pending_acks).await {
                        return; // fatal, state already set
                    }
                }
                Ok(None) => {}
                Err(TopicError::Closed) => break,
                Err(e @ (TopicError::Deserialization { .. } | TopicError::Envelope(_))) => {
                    tracing::error!(
                        service = %self.core.name(),
                        error = %e,
                        "Poisonous message left unacknowledged for inspection"
                    );
                    self.core.set_state(ServiceState::Error);
                    return;
                }
                Err(e) => {
                    tracing::warn!(service = %self.core.name(), error = %e, "Receive failed");
                }
            }

            if buffer.flush_due() {
                self.flush_and_ack(&mut buffer, &mut pending_acks).await;
            }
        }

        // best-effort final flush on shutdown
        if !buffer.is_empty() || !pending_acks.is_empty() {
            self.flush_and_ack(&mut buffer, &mut pending_acks).await;
        }
        self.core.set_state(ServiceState::Stopped);
    }

    /// Resolve one notification into buffered ticks. Returns false on fatal.
    async fn ingest(
        self: &Arc<Self>,
        message: &TopicMessage,
        buffer: &mut TickBuffer,
        pending_acks: &mut Vec<TopicMessage>,
    ) -> bool {
        let info = match message.payload() {
            DecodedPayload::Batch(info) => info.clone(),
            DecodedPayload::Metadata(info) => {
                // metadata notifications do not belong on this subscription
                tracing::warn!(
                    service = %self.core.name(),
                    storage_key = %info.storage_key,
                    "Ignoring metadata notification on batch subscription"
                );
                if let Err(e) = self.reader.ack_async(message.clone()).await {
                    tracing::warn!(error = %e, "Ack of ignored message failed");
                }
                return true;
            }
        };

        let blob = match self.storage.read_message(&info.storage_key).await {
            Ok(blob) => blob,
            Err(e) => {
                // transient: no ack, redelivered after the claim timeout
                self.storage_monitor.record_error(
                    codes::WRITE_FAILED,
                    "batch blob read failed",
                    format!("key={} error={e}", info.storage_key),
                );
                return true;
            }
        };

        let batch = match TickDataBatch::decode(&blob[..]) {
            Ok(batch) => batch,
            Err(e) => {
                self.storage_monitor.record_error(
                    codes::DESERIALIZATION_ERROR,
                    "batch blob failed to decode",
                    format!("key={} error={e}", info.storage_key),
                );
                tracing::error!(
                    service = %self.core.name(),
                    storage_key = %info.storage_key,
                    "Undecodable batch left unacknowledged for inspection"
                );
                self.core.set_state(ServiceState::Error);
                return false;
            }
        };

        for tick in batch.ticks {
            buffer.offer(tick);
        }
        pending_acks.push(message.clone());
        true
    }

    /// Flush buffered ticks; ack the contributing messages only on success.
    async fn flush_and_ack(
        self: &Arc<Self>,
        buffer: &mut TickBuffer,
        pending_acks: &mut Vec<TopicMessage>,
    ) {
        if buffer.is_empty() {
            // nothing to write, but empty batches may still need acks
            for message in pending_acks.drain(..) {
                if let Err(e) = self.reader.ack_async(message).await {
                    tracing::warn!(service = %self.core.name(), error = %e, "Ack failed");
                }
            }
            return;
        }

        let ticks = buffer.take();
        let indexer = Arc::clone(&self.indexer);
        let flushed = tokio::task::spawn_blocking(move || indexer.flush_ticks(&ticks)).await;

        match flushed {
            Ok(Ok(())) => {
                for message in pending_acks.drain(..) {
                    if let Err(e) = self.reader.ack_async(message).await {
                        tracing::warn!(service = %self.core.name(), error = %e, "Ack failed");
                    }
                }
            }
            Ok(Err(e)) => {
                // no ack: the batches will be redelivered and re-merged
                tracing::warn!(
                    service = %self.core.name(),
                    error = %e,
                    dropped_acks = pending_acks.len(),
                    "Flush failed, leaving messages for redelivery"
                );
                pending_acks.clear();
            }
            Err(e) => {
                tracing::warn!(service = %self.core.name(), error = %e, "Flush task failed");
                pending_acks.clear();
            }
        }
    }
}

#[async_trait]
impl Service for BatchIndexerService {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> ServiceState {
        self.core.state()
    }

    async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        if !self.core.transition_to_running() {
            return Ok(());
        }
        let runner = Arc::clone(&self);
        let handle = tokio::spawn(async move { runner.run().await });
        self.core.attach_task(handle).await;
        Ok(())
    }

    async fn stop(&self) {
        self.core.stop_and_join().await;
    }

    fn pause(&self) {
        self.core.pause();
    }

    fn resume(&self) {
        self.core.resume();
    }
}
