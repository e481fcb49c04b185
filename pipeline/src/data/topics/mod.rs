//! Durable topic engine
//!
//! Publish/subscribe with competing-consumer semantics over the relational
//! database. Messages are durable rows in `topic_messages`; per-group
//! delivery state lives in `topic_consumer_group`. Within one consumer group
//! each message is delivered to exactly one consumer at a time with
//! at-least-once semantics: a claim that is not acknowledged within the
//! claim timeout becomes reclaimable, its `claim_version` increments, and
//! any late ack is rejected by the version guard.
//!
//! Delegates ([`TopicWriter`], [`TopicReader`]) each own a dedicated
//! database connection and their schema-qualified statement set, rendered
//! once when the delegate is bound to a simulation run.

pub mod error;
pub mod notify;
mod reader;
mod writer;

pub use error::TopicError;
pub use notify::{NotificationHub, WakeQueue};
pub use reader::TopicReader;
pub use writer::TopicWriter;

use duckdb::Connection;

use crate::data::error::DataError;
use crate::utils::time::now_ms;
use crate::wire::{DecodedPayload, TopicEnvelope};

// counter names shared by delegates and health output
pub(crate) const COUNTER_PUBLISHED: &str = "messages_published";
pub(crate) const COUNTER_RECEIVED: &str = "messages_received";
pub(crate) const COUNTER_ACKNOWLEDGED: &str = "messages_acknowledged";
pub(crate) const COUNTER_STALE_ACKS: &str = "stale_acks_rejected";
pub(crate) const COUNTER_STUCK_REASSIGNED: &str = "stuck_messages_reassigned";
pub(crate) const COUNTER_CLAIM_CONFLICTS: &str = "claim_conflicts";

/// Opaque acknowledgement token: the claimed row and the claim version the
/// consumer holds. Acks carrying an outdated version are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckToken {
    pub row_id: i64,
    pub claim_version: i64,
}

/// A message handed to a consumer by [`TopicReader::receive`].
#[derive(Debug, Clone)]
pub struct TopicMessage {
    envelope: TopicEnvelope,
    payload: DecodedPayload,
    token: AckToken,
}

impl TopicMessage {
    pub fn envelope(&self) -> &TopicEnvelope {
        &self.envelope
    }

    pub fn payload(&self) -> &DecodedPayload {
        &self.payload
    }

    pub fn token(&self) -> AckToken {
        self.token
    }
}

/// Snapshot of one topic/group pair for monitoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicStats {
    /// Total durable messages on the topic.
    pub length: u64,
    /// Claimed but not yet acknowledged for this group.
    pub pending: u64,
    /// Distinct consumers that currently hold claims in this group.
    pub consumers: u64,
    /// Age of the oldest unacknowledged claim, if any.
    pub oldest_pending_ms: Option<u64>,
}

/// Compute [`TopicStats`] for a topic and consumer group.
pub fn topic_stats(
    conn: &Connection,
    schema: &str,
    topic: &str,
    group: &str,
) -> Result<TopicStats, DataError> {
    let length: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {schema}.topic_messages WHERE topic_name = ?"),
        duckdb::params![topic],
        |row| row.get(0),
    )?;

    let (pending, consumers, oldest_claim): (i64, i64, Option<i64>) = conn.query_row(
        &format!(
            "SELECT count(*), count(DISTINCT claimed_by), min(claimed_at)
             FROM {schema}.topic_consumer_group
             WHERE topic_name = ? AND consumer_group = ?
               AND claimed_by IS NOT NULL AND acknowledged_at IS NULL"
        ),
        duckdb::params![topic, group],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    Ok(TopicStats {
        length: length as u64,
        pending: pending as u64,
        consumers: consumers as u64,
        oldest_pending_ms: oldest_claim.map(|at| (now_ms() - at).max(0) as u64),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::core::constants::DEFAULT_METRICS_WINDOW_MS;
    use crate::data::relational::schema::schema_for_run;
    use crate::data::relational::tests::create_test_service;
    use crate::data::relational::RelationalService;
    use crate::services::monitor::ResourceMonitor;
    use crate::wire::{wrap_payload, BatchInfo, DecodedPayload};

    pub(crate) struct TopicFixture {
        pub _tmp: tempfile::TempDir,
        pub service: Arc<RelationalService>,
        pub hub: Arc<NotificationHub>,
        pub monitor: Arc<ResourceMonitor>,
        pub run_id: String,
    }

    pub(crate) async fn fixture(run_id: &str) -> TopicFixture {
        let (_tmp, service) = create_test_service().await;
        TopicFixture {
            _tmp,
            service,
            hub: Arc::new(NotificationHub::new()),
            monitor: Arc::new(ResourceMonitor::new("topic-test", DEFAULT_METRICS_WINDOW_MS)),
            run_id: run_id.to_string(),
        }
    }

    impl TopicFixture {
        pub fn writer(&self, topic: &str) -> Arc<TopicWriter> {
            let conn = self.service.delegate_connection().unwrap();
            let writer = Arc::new(TopicWriter::new(
                topic,
                conn,
                Arc::clone(&self.hub),
                Arc::clone(&self.monitor),
            ));
            writer.set_simulation_run(&self.run_id).unwrap();
            writer
        }

        pub fn reader(&self, topic: &str, group: &str, claim_timeout: Duration) -> Arc<TopicReader> {
            let conn = self.service.delegate_connection().unwrap();
            let reader = Arc::new(TopicReader::new(
                topic,
                group,
                claim_timeout,
                conn,
                Arc::clone(&self.hub),
                Arc::clone(&self.monitor),
            ));
            reader.set_simulation_run(&self.run_id).unwrap();
            reader
        }
    }

    pub(crate) fn batch_payload(tick_start: i64) -> DecodedPayload {
        DecodedPayload::Batch(BatchInfo {
            simulation_run_id: "2025101412000000-r".into(),
            storage_key: format!("r/batch_{tick_start:010}_{:010}.pb", tick_start + 99),
            tick_start,
            tick_end: tick_start + 99,
            written_at_ms: now_ms(),
        })
    }

    #[tokio::test]
    async fn test_topic_stats_counts() {
        let fx = fixture("20251014120000aa-9").await;
        let writer = fx.writer("batches");
        let reader = fx.reader("batches", "g", Duration::from_secs(60));

        writer.publish(&wrap_payload(&batch_payload(0))).unwrap();
        writer.publish(&wrap_payload(&batch_payload(100))).unwrap();

        let msg = reader
            .receive(Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();

        let schema = schema_for_run(&fx.run_id).unwrap();
        let conn = fx.service.conn();
        let stats = topic_stats(&conn, &schema, "batches", "g").unwrap();
        assert_eq!(stats.length, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.consumers, 1);
        assert!(stats.oldest_pending_ms.is_some());
        drop(conn);

        reader.ack(&msg).unwrap();
        let conn = fx.service.conn();
        let stats = topic_stats(&conn, &schema, "batches", "g").unwrap();
        assert_eq!(stats.pending, 0);
    }
}
