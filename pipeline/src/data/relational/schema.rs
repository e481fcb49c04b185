//! Per-run schema management
//!
//! Every simulation run owns exactly one database schema named after the
//! sanitized run id (`sim_` prefix, hyphens replaced by underscores). All
//! DDL here is idempotent; schema creation races between indexers and topic
//! delegates are resolved by `IF NOT EXISTS`.

use duckdb::Connection;
use parking_lot::{Mutex, MutexGuard};

use crate::data::error::DataError;

// Catalog writes from concurrent connections can abort each other even when
// every statement is IF NOT EXISTS, so all DDL in the process is serialized.
static DDL_LOCK: Mutex<()> = Mutex::new(());

/// Serialize a DDL section against every other connection in the process.
pub(crate) fn ddl_guard() -> MutexGuard<'static, ()> {
    DDL_LOCK.lock()
}

/// Derive the schema name for a run id.
///
/// Run ids are validated strictly because the schema name is interpolated
/// into DDL and can never be bound as a parameter.
pub fn schema_for_run(run_id: &str) -> Result<String, DataError> {
    if run_id.is_empty() {
        return Err(DataError::InvalidRunId {
            run_id: run_id.to_string(),
            reason: "empty",
        });
    }
    if !run_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(DataError::InvalidRunId {
            run_id: run_id.to_string(),
            reason: "unexpected character",
        });
    }
    Ok(format!("sim_{}", run_id.replace('-', "_")))
}

/// Create the run schema if it does not exist yet.
pub fn ensure_schema(conn: &Connection, schema: &str) -> Result<(), DataError> {
    let _ddl = ddl_guard();
    conn.execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS {schema};"))
        .map_err(|source| DataError::SchemaSetup {
            schema: schema.to_string(),
            source,
        })
}

/// Create the topic tables inside a run schema.
///
/// `topic_messages.id` is fed by a per-schema sequence, which keeps it
/// strictly increasing across writers and process restarts.
pub fn ensure_topic_tables(conn: &Connection, schema: &str) -> Result<(), DataError> {
    let _ddl = ddl_guard();
    let ddl = format!(
        "CREATE SEQUENCE IF NOT EXISTS {schema}.topic_messages_seq;
         CREATE TABLE IF NOT EXISTS {schema}.topic_messages (
             id           BIGINT PRIMARY KEY DEFAULT nextval('{schema}.topic_messages_seq'),
             topic_name   VARCHAR NOT NULL,
             message_id   VARCHAR NOT NULL,
             timestamp    BIGINT NOT NULL,
             envelope     BLOB NOT NULL,
             created_at   TIMESTAMP NOT NULL DEFAULT current_timestamp,
             UNIQUE (topic_name, message_id)
         );
         CREATE INDEX IF NOT EXISTS idx_topic_messages_topic_id
             ON {schema}.topic_messages (topic_name, id);
         CREATE TABLE IF NOT EXISTS {schema}.topic_consumer_group (
             topic_name       VARCHAR NOT NULL,
             consumer_group   VARCHAR NOT NULL,
             message_id       VARCHAR NOT NULL,
             claimed_by       VARCHAR,
             claimed_at       BIGINT,
             claim_version    BIGINT NOT NULL DEFAULT 1,
             acknowledged_at  BIGINT,
             PRIMARY KEY (topic_name, consumer_group, message_id)
         );
         CREATE INDEX IF NOT EXISTS idx_topic_consumer_group_claims
             ON {schema}.topic_consumer_group (topic_name, claimed_by, claimed_at);"
    );
    conn.execute_batch(&ddl).map_err(|source| DataError::SchemaSetup {
        schema: schema.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::relational::tests::create_test_service;

    #[test]
    fn test_schema_for_run_sanitizes() {
        let schema = schema_for_run("2025101412000000-9f8e").unwrap();
        assert_eq!(schema, "sim_2025101412000000_9f8e");
    }

    #[test]
    fn test_schema_for_run_rejects_injection() {
        assert!(schema_for_run("run; DROP SCHEMA x").is_err());
        assert!(schema_for_run("").is_err());
        assert!(schema_for_run("run id").is_err());
    }

    #[tokio::test]
    async fn test_ensure_schema_idempotent() {
        let (_tmp, service) = create_test_service().await;
        let conn = service.conn();
        let schema = schema_for_run("20251014120000aa-1").unwrap();

        ensure_schema(&conn, &schema).unwrap();
        ensure_schema(&conn, &schema).unwrap();
        ensure_topic_tables(&conn, &schema).unwrap();
        ensure_topic_tables(&conn, &schema).unwrap();

        let count: i64 = conn
            .query_row(
                &format!("SELECT count(*) FROM {schema}.topic_messages"),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_message_ids_increase() {
        let (_tmp, service) = create_test_service().await;
        let conn = service.conn();
        let schema = schema_for_run("20251014120000aa-2").unwrap();
        ensure_schema(&conn, &schema).unwrap();
        ensure_topic_tables(&conn, &schema).unwrap();

        let insert = format!(
            "INSERT INTO {schema}.topic_messages (topic_name, message_id, timestamp, envelope)
             VALUES (?, ?, ?, ?) RETURNING id"
        );
        let first: i64 = conn
            .query_row(&insert, duckdb::params!["t", "m1", 1i64, b"x".to_vec()], |row| row.get(0))
            .unwrap();
        let second: i64 = conn
            .query_row(&insert, duckdb::params!["t", "m2", 2i64, b"y".to_vec()], |row| row.get(0))
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_schema_isolation_survives_drop() {
        let (_tmp, service) = create_test_service().await;
        let conn = service.conn();
        let schema_a = schema_for_run("20251014120000aa-4a").unwrap();
        let schema_b = schema_for_run("20251014120000aa-4b").unwrap();

        for schema in [&schema_a, &schema_b] {
            ensure_schema(&conn, schema).unwrap();
            ensure_topic_tables(&conn, schema).unwrap();
        }
        conn.execute(
            &format!(
                "INSERT INTO {schema_b}.topic_messages (topic_name, message_id, timestamp, envelope)
                 VALUES (?, ?, ?, ?)"
            ),
            duckdb::params!["t", "m1", 1i64, b"x".to_vec()],
        )
        .unwrap();

        // dropping one run's schema leaves the other fully operational
        conn.execute_batch(&format!("DROP SCHEMA {schema_a} CASCADE;")).unwrap();
        let survivors: i64 = conn
            .query_row(
                &format!("SELECT count(*) FROM {schema_b}.topic_messages"),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(survivors, 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_id_rejected() {
        let (_tmp, service) = create_test_service().await;
        let conn = service.conn();
        let schema = schema_for_run("20251014120000aa-3").unwrap();
        ensure_schema(&conn, &schema).unwrap();
        ensure_topic_tables(&conn, &schema).unwrap();

        let insert = format!(
            "INSERT INTO {schema}.topic_messages (topic_name, message_id, timestamp, envelope)
             VALUES (?, ?, ?, ?)"
        );
        conn.execute(&insert, duckdb::params!["t", "m1", 1i64, b"x".to_vec()])
            .unwrap();
        assert!(
            conn.execute(&insert, duckdb::params!["t", "m1", 2i64, b"y".to_vec()])
                .is_err()
        );
    }
}
