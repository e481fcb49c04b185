//! Metadata indexer
//!
//! Loads `runId/metadata.pb`, merges it into the per-run `metadata` table
//! and opens the metadata gate for downstream indexers. Unlike the batch
//! indexers this service has no dead-letter path: everything downstream
//! depends on the metadata, so any failure here is fatal and the service
//! transitions to Error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use serde_json::json;
use tokio::time::Instant;

use super::discovery::{DiscoveryError, RunDiscovery};
use super::metadata_gate::MetadataGate;
use crate::data::blobs::{metadata_key, RunStore, StorageError};
use crate::data::error::{codes, DataError};
use crate::data::relational::schema::{ensure_schema, schema_for_run};
use crate::data::topics::TopicReader;
use crate::services::resource::DatabaseHandle;
use crate::services::{Service, ServiceCore, ServiceState};
use crate::utils::time::now_ms;
use crate::wire::{DecodedPayload, SimulationMetadata};

/// Metadata keys written on first load.
const KEY_ENVIRONMENT: &str = "environment";
const KEY_SIMULATION_INFO: &str = "simulation_info";

#[derive(Debug, Clone)]
pub struct MetadataIndexerConfig {
    pub discovery: RunDiscovery,
    pub file_poll_interval: Duration,
    pub file_max_poll_duration: Duration,
}

pub struct MetadataIndexerService {
    core: ServiceCore,
    config: MetadataIndexerConfig,
    storage: Arc<dyn RunStore>,
    db: DatabaseHandle,
    /// Metadata-topic subscription for refresh notifications.
    reader: Arc<TopicReader>,
    gate: MetadataGate,
    merge_sql: Mutex<Option<String>>,
}

impl MetadataIndexerService {
    pub fn new(
        name: impl Into<String>,
        config: MetadataIndexerConfig,
        storage: Arc<dyn RunStore>,
        db: DatabaseHandle,
        reader: Arc<TopicReader>,
        gate: MetadataGate,
    ) -> Self {
        Self {
            core: ServiceCore::new(name),
            config,
            storage,
            db,
            reader,
            gate,
            merge_sql: Mutex::new(None),
        }
    }

    pub fn gate(&self) -> MetadataGate {
        self.gate.clone()
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

        if let Err(e) = self.index_initial(&run_id).await {
            tracing::error!(service = %self.core.name(), error = %e, "Metadata indexing failed");
            self.core.set_state(ServiceState::Error);
            return;
        }

        self.refresh_loop(cancel).await;
    }

    /// Discovery is done: prepare the schema, poll the metadata blob in, and
    /// merge it. Every failure here is fatal.
    async fn index_initial(self: &Arc<Self>, run_id: &str) -> anyhow::Result<()> {
        {
            let this = Arc::clone(self);
            let run_id = run_id.to_string();
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                this.reader.set_simulation_run(&run_id)?;
                this.prepare_schema(&run_id)?;
                Ok(())
            })
            .await??;
        }

        let blob = self.poll_metadata_blob(run_id).await?;
        let metadata = SimulationMetadata::decode(&blob[..])?;

        {
            let this = Arc::clone(self);
            let metadata = metadata.clone();
            tokio::task::spawn_blocking(move || this.merge_metadata(&metadata)).await??;
        }

        self.gate.set(metadata);
        tracing::info!(service = %self.core.name(), run_id, "Metadata indexed");
        Ok(())
    }

    fn prepare_schema(&self, run_id: &str) -> Result<(), DataError> {
        let schema = schema_for_run(run_id)?;
        self.db.with_conn(|conn| {
            ensure_schema(conn, &schema)?;
            let _ddl = crate::data::relational::schema::ddl_guard();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {schema}.metadata (
                     key    VARCHAR PRIMARY KEY,
                     value  JSON NOT NULL
                 );"
            ))
            .map_err(|source| DataError::SchemaSetup {
                schema: schema.clone(),
                source,
            })
        })?;
        *self.merge_sql.lock() = Some(format!(
            "INSERT INTO {schema}.metadata (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value"
        ));
        Ok(())
    }

    /// Wait for `runId/metadata.pb` to appear, bounded by the file poll cap.
    async fn poll_metadata_blob(&self, run_id: &str) -> anyhow::Result<Vec<u8>> {
        let key = metadata_key(run_id);
        let started = Instant::now();
        loop {
            match self.storage.read_message(&key).await {
                Ok(blob) => return Ok(blob),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if started.elapsed() >= self.config.file_max_poll_duration {
                anyhow::bail!(
                    "metadata blob {key} did not appear within {}ms",
                    self.config.file_max_poll_duration.as_millis()
                );
            }
            if self.core.is_cancelled() {
                anyhow::bail!("cancelled while waiting for metadata blob");
            }
            tokio::time::sleep(self.config.file_poll_interval).await;
        }
    }

    /// MERGE the `environment` and `simulation_info` keys.
    fn merge_metadata(&self, metadata: &SimulationMetadata) -> Result<(), DataError> {
        let merge_sql = self
            .merge_sql
            .lock()
            .clone()
            .ok_or_else(|| DataError::Config("metadata schema not prepared".into()))?;

        let environment = metadata
            .environment
            .as_ref()
            .map(|env| {
                json!({
                    "dimensions": env.dimensions,
                    "shape": env.shape,
                    "toroidal": env.toroidal,
                })
            })
            .unwrap_or_else(|| json!(null));
        let simulation_info = json!({
            "simulation_run_id": metadata.simulation_run_id,
            "start_time_ms": metadata.start_time_ms,
            "initial_seed": metadata.initial_seed,
        });

        self.db.with_conn(|conn| {
            crate::data::relational::in_transaction(conn, |conn| {
                conn.execute(
                    &merge_sql,
                    duckdb::params![KEY_ENVIRONMENT, environment.to_string()],
                )?;
                conn.execute(
                    &merge_sql,
                    duckdb::params![KEY_SIMULATION_INFO, simulation_info.to_string()],
                )?;
                Ok(())
            })
            .map_err(|e| {
                self.db.monitor().record_error(
                    codes::INSERT_METADATA_FAILED,
                    "metadata merge failed",
                    e.to_string(),
                );
                e
            })
        })
    }

    /// After the initial load, re-index on every metadata notification.
    async fn refresh_loop(self: &Arc<Self>, mut cancel: tokio::sync::watch::Receiver<bool>) {
        loop {
            self.core.wait_if_paused().await;
            if self.core.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = cancel.changed() => continue,
                received = self.reader.receive(Duration::from_millis(500)) => received,
            };

            match received {
                Ok(Some(message)) => {
                    let DecodedPayload::Metadata(info) = message.payload().clone() else {
                        tracing::warn!(
                            service = %self.core.name(),
                            "Ignoring non-metadata notification"
                        );
                        let _ = self.reader.ack_async(message).await;
                        continue;
                    };

                    match self.refresh(&info.simulation_run_id).await {
                        Ok(()) => {
                            if let Err(e) = self.reader.ack_async(message).await {
                                tracing::warn!(service = %self.core.name(), error = %e, "Ack failed");
                            }
                        }
                        Err(e) => {
                            // fatal: downstream indexers depend on metadata
                            tracing::error!(
                                service = %self.core.name(),
                                error = %e,
                                "Metadata refresh failed"
                            );
                            self.core.set_state(ServiceState::Error);
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(crate::data::topics::TopicError::Closed) => break,
                Err(e) => {
                    tracing::warn!(service = %self.core.name(), error = %e, "Receive failed");
                }
            }
        }
        self.core.set_state(ServiceState::Stopped);
    }

    async fn refresh(self: &Arc<Self>, run_id: &str) -> anyhow::Result<()> {
        let blob = self.storage.read_message(&metadata_key(run_id)).await?;
        let metadata = SimulationMetadata::decode(&blob[..])?;
        {
            let this = Arc::clone(self);
            let metadata = metadata.clone();
            tokio::task::spawn_blocking(move || this.merge_metadata(&metadata)).await??;
        }
        self.gate.set(metadata);
        Ok(())
    }
}

#[async_trait]
impl Service for MetadataIndexerService {
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
