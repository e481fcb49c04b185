//! Organism indexer
//!
//! Splits each organism's wire state into the write-once static row
//! (`organisms`) and the per-tick row (`organism_states`). Grid-critical
//! fields get dedicated columns; the remaining runtime state is packed into
//! a single codec-framed blob. Both writes are MERGEs on the natural key,
//! so redelivered batches converge to the same rows.

use parking_lot::Mutex;
use prost::Message;

use super::{BatchIndexer, IndexerError};
use crate::data::codec::{encode_blob, BlobCodec};
use crate::data::error::codes;
use crate::data::relational::schema::{ensure_schema, schema_for_run};
use crate::services::resource::DatabaseHandle;
use crate::wire::{pack_vector, pack_vectors, TickData};

#[derive(Clone)]
struct PreparedSql {
    merge_static: String,
    merge_state: String,
}

pub struct OrganismIndexer {
    db: DatabaseHandle,
    codec: BlobCodec,
    prepared: Mutex<Option<PreparedSql>>,
}

impl OrganismIndexer {
    pub fn new(db: DatabaseHandle, codec: BlobCodec) -> Self {
        Self {
            db,
            codec,
            prepared: Mutex::new(None),
        }
    }
}

impl BatchIndexer for OrganismIndexer {
    fn name(&self) -> &str {
        "organism-indexer"
    }

    fn prepare_schema(&self, run_id: &str) -> Result<(), IndexerError> {
        let schema = schema_for_run(run_id)?;
        self.db.with_conn(|conn| {
            ensure_schema(conn, &schema)?;
            let _ddl = crate::data::relational::schema::ddl_guard();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {schema}.organisms (
                     organism_id       BIGINT PRIMARY KEY,
                     parent_id         BIGINT,
                     birth_tick        BIGINT NOT NULL,
                     program_id        VARCHAR NOT NULL,
                     initial_position  BLOB
                 );
                 CREATE TABLE IF NOT EXISTS {schema}.organism_states (
                     tick_number         BIGINT NOT NULL,
                     organism_id         BIGINT NOT NULL,
                     energy              BIGINT NOT NULL,
                     ip                  BLOB,
                     dv                  BLOB,
                     data_pointers       BLOB,
                     active_dp_index     INTEGER NOT NULL,
                     runtime_state_blob  BLOB NOT NULL,
                     PRIMARY KEY (tick_number, organism_id)
                 );"
            ))
            .map_err(|source| {
                self.db.monitor().record_error(
                    codes::SCHEMA_SETUP_FAILED,
                    "organism table setup failed",
                    source.to_string(),
                );
                crate::data::error::DataError::SchemaSetup {
                    schema: schema.clone(),
                    source,
                }
            })
        })?;

        *self.prepared.lock() = Some(PreparedSql {
            merge_static: format!(
                "INSERT INTO {schema}.organisms
                     (organism_id, parent_id, birth_tick, program_id, initial_position)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (organism_id) DO NOTHING"
            ),
            merge_state: format!(
                "INSERT INTO {schema}.organism_states
                     (tick_number, organism_id, energy, ip, dv, data_pointers,
                      active_dp_index, runtime_state_blob)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (tick_number, organism_id) DO UPDATE SET
                     energy = excluded.energy,
                     ip = excluded.ip,
                     dv = excluded.dv,
                     data_pointers = excluded.data_pointers,
                     active_dp_index = excluded.active_dp_index,
                     runtime_state_blob = excluded.runtime_state_blob"
            ),
        });
        Ok(())
    }

    fn flush_ticks(&self, ticks: &[TickData]) -> Result<(), IndexerError> {
        let prepared = self
            .prepared
            .lock()
            .clone()
            .ok_or(IndexerError::NotPrepared)?;

        // frame every runtime blob before touching the database so a codec
        // failure cannot leave a half-written transaction behind
        let mut static_rows = Vec::new();
        let mut state_rows = Vec::new();
        for tick in ticks {
            for organism in &tick.organisms {
                let runtime = organism.runtime_state().encode_to_vec();
                let blob = encode_blob(self.codec, &runtime)?;
                static_rows.push((
                    organism.organism_id,
                    organism.parent_id,
                    organism.birth_tick,
                    organism.program_id.clone(),
                    organism.initial_position.as_ref().map(pack_vector),
                ));
                state_rows.push((
                    tick.tick_number,
                    organism.organism_id,
                    organism.energy,
                    organism.ip.as_ref().map(pack_vector),
                    organism.dv.as_ref().map(pack_vector),
                    pack_vectors(&organism.data_pointers),
                    organism.active_dp_index,
                    blob,
                ));
            }
        }

        self.db.with_conn(|conn| {
            crate::data::relational::in_transaction(conn, |conn| {
                for (organism_id, parent_id, birth_tick, program_id, initial_position) in
                    &static_rows
                {
                    conn.execute(
                        &prepared.merge_static,
                        duckdb::params![
                            organism_id,
                            parent_id,
                            birth_tick,
                            program_id,
                            initial_position
                        ],
                    )?;
                }
                for (
                    tick_number,
                    organism_id,
                    energy,
                    ip,
                    dv,
                    data_pointers,
                    active_dp_index,
                    blob,
                ) in &state_rows
                {
                    conn.execute(
                        &prepared.merge_state,
                        duckdb::params![
                            tick_number,
                            organism_id,
                            energy,
                            ip,
                            dv,
                            data_pointers,
                            active_dp_index,
                            blob
                        ],
                    )?;
                }
                Ok(())
            })
            .map_err(|e| {
                self.db.monitor().record_error(
                    codes::WRITE_FAILED,
                    "organism flush failed",
                    e.to_string(),
                );
                e
            })
        })?;
        Ok(())
    }
}
