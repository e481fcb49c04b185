//! Persistence service
//!
//! Consumes ticks from the engine queue, writes them to the blob store in
//! inclusive tick-range batches, and publishes a `BatchInfo` notification
//! for every persisted batch. On startup it writes `runId/metadata.pb` and
//! publishes the corresponding `MetadataInfo` so that indexers can discover
//! the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::Mutex;

use crate::data::blobs::{batch_key, metadata_key, RunStore};
use crate::data::error::codes;
use crate::data::topics::TopicWriter;
use crate::services::monitor::ResourceMonitor;
use crate::services::queue::QueueReceiver;
use crate::services::{Service, ServiceCore, ServiceState};
use crate::utils::time::now_ms;
use crate::wire::{
    wrap_payload, BatchInfo, DecodedPayload, MetadataInfo, SimulationMetadata, TickData,
    TickDataBatch,
};

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Fixed run id; generated at start when absent so that live-mode
    /// indexers (which only consider runs newer than their own start time)
    /// can discover the run.
    pub run_id: Option<String>,
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

pub struct PersistenceService {
    core: ServiceCore,
    config: PersistenceConfig,
    metadata: SimulationMetadata,
    input: Mutex<Option<QueueReceiver<TickData>>>,
    storage: Arc<dyn RunStore>,
    storage_monitor: Arc<ResourceMonitor>,
    batch_writer: Arc<TopicWriter>,
    metadata_writer: Arc<TopicWriter>,
}

impl PersistenceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        config: PersistenceConfig,
        metadata: SimulationMetadata,
        input: QueueReceiver<TickData>,
        storage: Arc<dyn RunStore>,
        storage_monitor: Arc<ResourceMonitor>,
        batch_writer: Arc<TopicWriter>,
        metadata_writer: Arc<TopicWriter>,
    ) -> Self {
        Self {
            core: ServiceCore::new(name),
            config,
            metadata,
            input: Mutex::new(Some(input)),
            storage,
            storage_monitor,
            batch_writer,
            metadata_writer,
        }
    }

    async fn run(self: Arc<Self>) {
        let Some(mut input) = self.input.lock().await.take() else {
            tracing::error!(service = %self.core.name(), "Input queue already taken");
            self.core.set_state(ServiceState::Error);
            return;
        };

        let run_id = self
            .config
            .run_id
            .clone()
            .unwrap_or_else(crate::data::blobs::new_run_id);
        if let Err(e) = self.start_run(&run_id).await {
            tracing::error!(service = %self.core.name(), error = %e, "Run start failed");
            self.core.set_state(ServiceState::Error);
            return;
        }

        let mut batch: Vec<TickData> = Vec::with_capacity(self.config.batch_size);
        loop {
            self.core.wait_if_paused().await;
            if self.core.is_cancelled() {
                break;
            }

            match input.poll_timeout(self.config.flush_timeout).await {
                Some(tick) => {
                    batch.push(tick);
                    let remaining = self.config.batch_size.saturating_sub(batch.len());
                    input.drain_to(&mut batch, remaining);
                    if batch.len() >= self.config.batch_size {
                        self.persist_batch(&run_id, &mut batch).await;
                    }
                }
                None => {
                    // idle or closed; age out whatever is pending
                    if !batch.is_empty() {
                        self.persist_batch(&run_id, &mut batch).await;
                    }
                }
            }
        }

        // drain the queue and flush the tail
        input.drain_to(&mut batch, usize::MAX);
        if !batch.is_empty() {
            self.persist_batch(&run_id, &mut batch).await;
        }
        self.core.set_state(ServiceState::Stopped);
    }

    /// Bind the writers, persist the run metadata and announce it.
    async fn start_run(self: &Arc<Self>, run_id: &str) -> anyhow::Result<()> {
        let run_id = run_id.to_string();
        {
            let batch_writer = Arc::clone(&self.batch_writer);
            let metadata_writer = Arc::clone(&self.metadata_writer);
            let run_id = run_id.clone();
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                batch_writer.set_simulation_run(&run_id)?;
                metadata_writer.set_simulation_run(&run_id)?;
                Ok(())
            })
            .await??;
        }

        let mut metadata = self.metadata.clone();
        metadata.simulation_run_id = run_id.clone();
        let key = metadata_key(&run_id);
        self.storage
            .write_message(&key, &metadata.encode_to_vec())
            .await?;
        self.metadata_writer
            .publish_async(wrap_payload(&DecodedPayload::Metadata(MetadataInfo {
                simulation_run_id: run_id.clone(),
                storage_key: key,
                written_at_ms: now_ms(),
            })))
            .await?;
        tracing::info!(service = %self.core.name(), %run_id, "Simulation run persisted");
        Ok(())
    }

    /// Write one batch blob and publish its notification.
    ///
    /// Storage failures keep the ticks for the next attempt; the engine
    /// stays decoupled through the queue either way.
    async fn persist_batch(&self, run_id: &str, batch: &mut Vec<TickData>) {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return;
        };
        let tick_start = first.tick_number;
        let tick_end = last.tick_number;
        let key = batch_key(run_id, tick_start, tick_end);

        let blob = TickDataBatch {
            ticks: batch.clone(),
        }
        .encode_to_vec();

        if let Err(e) = self.storage.write_message(&key, &blob).await {
            self.storage_monitor.record_error(
                codes::WRITE_FAILED,
                "batch blob write failed",
                format!("key={key} error={e}"),
            );
            return;
        }

        let info = BatchInfo {
            simulation_run_id: run_id.to_string(),
            storage_key: key,
            tick_start,
            tick_end,
            written_at_ms: now_ms(),
        };
        match self
            .batch_writer
            .publish_async(wrap_payload(&DecodedPayload::Batch(info)))
            .await
        {
            Ok(_) => {
                batch.clear();
                tracing::debug!(
                    service = %self.core.name(),
                    tick_start,
                    tick_end,
                    "Batch persisted"
                );
            }
            Err(e) => {
                // keep the ticks: the next cycle rewrites the blob and
                // publishes a fresh notification, which the MERGE write
                // path downstream absorbs
                tracing::warn!(service = %self.core.name(), error = %e, "Batch publish failed");
            }
        }
    }
}

#[async_trait]
impl Service for PersistenceService {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::DEFAULT_METRICS_WINDOW_MS;
    use crate::data::blobs::FilesystemRunStore;
    use crate::data::topics::tests::fixture;
    use crate::services::queue::QueueResource;
    use crate::wire::EnvironmentSpec;

    fn metadata(run_id: &str) -> SimulationMetadata {
        SimulationMetadata {
            simulation_run_id: run_id.to_string(),
            environment: Some(EnvironmentSpec {
                dimensions: 2,
                shape: vec![10, 10],
                toroidal: vec![true, true],
            }),
            start_time_ms: now_ms(),
            initial_seed: 7,
        }
    }

    fn tick(n: i64) -> TickData {
        TickData {
            tick_number: n,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_persists_batches_and_notifies() {
        let fx = fixture("20251014120000aa-p1").await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemRunStore::new(dir.path()));
        let monitor = Arc::new(ResourceMonitor::new("run-store", DEFAULT_METRICS_WINDOW_MS));

        let queue = QueueResource::new("engine-queue", 64, Arc::clone(&fx.monitor));
        let sender = queue.output();
        let input = queue.input().unwrap();

        let svc = Arc::new(PersistenceService::new(
            "persistence",
            PersistenceConfig {
                run_id: Some(fx.run_id.clone()),
                batch_size: 3,
                flush_timeout: Duration::from_millis(100),
            },
            metadata(&fx.run_id),
            input,
            Arc::clone(&store) as Arc<dyn RunStore>,
            monitor,
            fx.writer("persisted-batches"),
            fx.writer("persisted-metadata"),
        ));
        Arc::clone(&svc).start().await.unwrap();

        // metadata lands first
        let meta_reader = fx.reader("persisted-metadata", "g", Duration::from_secs(60));
        let meta_msg = tokio::time::timeout(
            Duration::from_secs(5),
            meta_reader.receive(Duration::from_secs(4)),
        )
        .await
        .unwrap()
        .unwrap()
        .expect("metadata notification");
        let DecodedPayload::Metadata(info) = meta_msg.payload() else {
            panic!("expected metadata payload");
        };
        assert_eq!(info.storage_key, metadata_key(&fx.run_id));
        assert!(store.read_message(&info.storage_key).await.is_ok());
        meta_reader.ack(&meta_msg).unwrap();

        // three ticks form one full batch
        for n in 0..3 {
            sender.put(tick(n)).await.unwrap();
        }

        let batch_reader = fx.reader("persisted-batches", "g", Duration::from_secs(60));
        let batch_msg = tokio::time::timeout(
            Duration::from_secs(5),
            batch_reader.receive(Duration::from_secs(4)),
        )
        .await
        .unwrap()
        .unwrap()
        .expect("batch notification");
        let DecodedPayload::Batch(info) = batch_msg.payload() else {
            panic!("expected batch payload");
        };
        assert_eq!(info.tick_start, 0);
        assert_eq!(info.tick_end, 2);
        assert!(info.tick_start <= info.tick_end);

        let blob = store.read_message(&info.storage_key).await.unwrap();
        let decoded = TickDataBatch::decode(&blob[..]).unwrap();
        assert_eq!(decoded.ticks.len(), 3);
        batch_reader.ack(&batch_msg).unwrap();

        svc.stop().await;
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_on_idle() {
        let fx = fixture("20251014120000aa-p2").await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemRunStore::new(dir.path()));
        let monitor = Arc::new(ResourceMonitor::new("run-store", DEFAULT_METRICS_WINDOW_MS));

        let queue = QueueResource::new("engine-queue", 64, Arc::clone(&fx.monitor));
        let sender = queue.output();
        let input = queue.input().unwrap();

        let svc = Arc::new(PersistenceService::new(
            "persistence",
            PersistenceConfig {
                run_id: Some(fx.run_id.clone()),
                batch_size: 100,
                flush_timeout: Duration::from_millis(50),
            },
            metadata(&fx.run_id),
            input,
            Arc::clone(&store) as Arc<dyn RunStore>,
            monitor,
            fx.writer("persisted-batches"),
            fx.writer("persisted-metadata"),
        ));
        Arc::clone(&svc).start().await.unwrap();

        sender.put(tick(5)).await.unwrap();

        let batch_reader = fx.reader("persisted-batches", "g", Duration::from_secs(60));
        let batch_msg = tokio::time::timeout(
            Duration::from_secs(5),
            batch_reader.receive(Duration::from_secs(4)),
        )
        .await
        .unwrap()
        .unwrap()
        .expect("idle flush notification");
        let DecodedPayload::Batch(info) = batch_msg.payload() else {
            panic!("expected batch payload");
        };
        assert_eq!((info.tick_start, info.tick_end), (5, 5));
        batch_reader.ack(&batch_msg).unwrap();

        svc.stop().await;
    }
}
