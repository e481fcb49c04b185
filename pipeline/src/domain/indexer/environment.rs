//! Environment indexer
//!
//! One row per tick: the environment payload is stored as a codec-framed
//! blob keyed on the tick number. MERGE on the key keeps redelivery
//! idempotent.

use parking_lot::Mutex;
use prost::Message;

use super::{BatchIndexer, IndexerError};
use crate::data::codec::{encode_blob, BlobCodec};
use crate::data::error::codes;
use crate::data::relational::schema::{ensure_schema, schema_for_run};
use crate::services::resource::DatabaseHandle;
use crate::wire::TickData;

pub struct EnvironmentIndexer {
    db: DatabaseHandle,
    codec: BlobCodec,
    merge_sql: Mutex<Option<String>>,
}

impl EnvironmentIndexer {
    pub fn new(db: DatabaseHandle, codec: BlobCodec) -> Self {
        Self {
            db,
            codec,
            merge_sql: Mutex::new(None),
        }
    }
}

impl BatchIndexer for EnvironmentIndexer {
    fn name(&self) -> &str {
        "environment-indexer"
    }

    fn prepare_schema(&self, run_id: &str) -> Result<(), IndexerError> {
        let schema = schema_for_run(run_id)?;
        self.db.with_conn(|conn| {
            ensure_schema(conn, &schema)?;
            let _ddl = crate::data::relational::schema::ddl_guard();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {schema}.environment_states (
                     tick_number  BIGINT PRIMARY KEY,
                     state_blob   BLOB NOT NULL
                 );"
            ))
            .map_err(|source| {
                self.db.monitor().record_error(
                    codes::SCHEMA_SETUP_FAILED,
                    "environment table setup failed",
                    source.to_string(),
                );
                crate::data::error::DataError::SchemaSetup {
                    schema: schema.clone(),
                    source,
                }
            })
        })?;

        *self.merge_sql.lock() = Some(format!(
            "INSERT INTO {schema}.environment_states (tick_number, state_blob)
             VALUES (?, ?)
             ON CONFLICT (tick_number) DO UPDATE SET state_blob = excluded.state_blob"
        ));
        Ok(())
    }

    fn flush_ticks(&self, ticks: &[TickData]) -> Result<(), IndexerError> {
        let merge_sql = self
            .merge_sql
            .lock()
            .clone()
            .ok_or(IndexerError::NotPrepared)?;

        let mut rows = Vec::new();
        for tick in ticks {
            if let Some(state) = &tick.environment_state {
                let blob = encode_blob(self.codec, &state.encode_to_vec())?;
                rows.push((tick.tick_number, blob));
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        self.db.with_conn(|conn| {
            crate::data::relational::in_transaction(conn, |conn| {
                for (tick_number, blob) in &rows {
                    conn.execute(&merge_sql, duckdb::params![tick_number, blob])?;
                }
                Ok(())
            })
            .map_err(|e| {
                self.db.monitor().record_error(
                    codes::WRITE_FAILED,
                    "environment flush failed",
                    e.to_string(),
                );
                e
            })
        })?;
        Ok(())
    }
}
