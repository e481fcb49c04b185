//! Topic writer delegate

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use duckdb::Connection;
use parking_lot::Mutex;
use prost::Message;

use super::error::TopicError;
use super::notify::NotificationHub;
use super::COUNTER_PUBLISHED;
use crate::data::relational::schema::{ensure_schema, ensure_topic_tables, schema_for_run};
use crate::services::monitor::ResourceMonitor;
use crate::wire::TopicEnvelope;

#[derive(Clone)]
struct WriterBinding {
    run_id: String,
    schema: String,
    insert_sql: String,
}

/// Publishing delegate for one topic.
///
/// Owns a dedicated connection for its whole lifetime. Must be bound to a
/// simulation run via [`TopicWriter::set_simulation_run`] before the first
/// publish; rebinding to a different run is an error.
pub struct TopicWriter {
    topic: String,
    conn: Mutex<Connection>,
    hub: Arc<NotificationHub>,
    monitor: Arc<ResourceMonitor>,
    binding: Mutex<Option<WriterBinding>>,
    closed: AtomicBool,
}

impl TopicWriter {
    pub fn new(
        topic: impl Into<String>,
        conn: Connection,
        hub: Arc<NotificationHub>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            topic: topic.into(),
            conn: Mutex::new(conn),
            hub,
            monitor,
            binding: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Bind this delegate to a run: install the schema, the topic tables and
    /// the wake-up queue registration, and render the insert statement.
    ///
    /// Idempotent for the same run id; a different run id fails.
    pub fn set_simulation_run(&self, run_id: &str) -> Result<(), TopicError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TopicError::Closed);
        }

        let mut binding = self.binding.lock();
        if let Some(bound) = binding.as_ref() {
            if bound.run_id == run_id {
                return Ok(());
            }
            return Err(TopicError::RunAlreadyBound {
                bound: bound.run_id.clone(),
                requested: run_id.to_string(),
            });
        }

        let schema = schema_for_run(run_id)?;
        {
            let conn = self.conn.lock();
            ensure_schema(&conn, &schema)?;
            ensure_topic_tables(&conn, &schema)?;
        }
        self.hub.register(&self.topic, &schema);

        let insert_sql = format!(
            "INSERT INTO {schema}.topic_messages (topic_name, message_id, timestamp, envelope)
             VALUES (?, ?, ?, ?) RETURNING id"
        );
        tracing::debug!(topic = %self.topic, %schema, "Topic writer bound");
        *binding = Some(WriterBinding {
            run_id: run_id.to_string(),
            schema,
            insert_sql,
        });
        Ok(())
    }

    /// Append one envelope to the topic and wake the readers.
    ///
    /// Returns the durable row id. Safe to call from multiple tasks through
    /// an `Arc`; each insert commits on its own.
    pub fn publish(&self, envelope: &TopicEnvelope) -> Result<i64, TopicError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TopicError::Closed);
        }
        let binding = self.binding.lock().clone().ok_or(TopicError::NotBound)?;

        let bytes = envelope.encode_to_vec();
        let id: i64 = {
            let conn = self.conn.lock();
            conn.query_row(
                &binding.insert_sql,
                duckdb::params![
                    self.topic,
                    envelope.message_id,
                    envelope.timestamp,
                    bytes
                ],
                |row| row.get(0),
            )
            .map_err(|source| {
                self.monitor.record_error(
                    crate::data::error::codes::PUBLISH_FAILED,
                    "publish insert rejected",
                    format!("topic={} message_id={}", self.topic, envelope.message_id),
                );
                TopicError::Publish {
                    topic: self.topic.clone(),
                    source,
                }
            })?
        };

        // committed; notify readers of the new row
        self.hub.offer(&self.topic, &binding.schema, id);
        self.monitor.increment(COUNTER_PUBLISHED);
        Ok(id)
    }

    /// Publish from async context by offloading the blocking insert.
    pub async fn publish_async(
        self: &Arc<Self>,
        envelope: TopicEnvelope,
    ) -> Result<i64, TopicError> {
        let writer = Arc::clone(self);
        tokio::task::spawn_blocking(move || writer.publish(&envelope))
            .await
            .map_err(|e| TopicError::Task(e.to_string()))?
    }

    /// Close the delegate. Idempotent; subsequent publishes fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(topic = %self.topic, "Topic writer closed");
        }
    }

    /// Schema this writer is bound to, if bound.
    pub fn schema(&self) -> Option<String> {
        self.binding.lock().as_ref().map(|b| b.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::tests::{batch_payload, fixture};
    use super::*;
    use crate::wire::wrap_payload;

    #[tokio::test]
    async fn test_set_simulation_run_idempotent() {
        let fx = fixture("20251014120000aa-w1").await;
        let writer = fx.writer("batches");
        writer.set_simulation_run(&fx.run_id).unwrap();
        assert!(matches!(
            writer.set_simulation_run("20251014120000aa-w2"),
            Err(TopicError::RunAlreadyBound { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_before_bind_fails() {
        let fx = fixture("20251014120000aa-w3").await;
        let conn = fx.service.delegate_connection().unwrap();
        let writer = TopicWriter::new(
            "batches",
            conn,
            Arc::clone(&fx.hub),
            Arc::clone(&fx.monitor),
        );
        assert!(matches!(
            writer.publish(&wrap_payload(&batch_payload(0))),
            Err(TopicError::NotBound)
        ));
    }

    #[tokio::test]
    async fn test_publish_returns_increasing_ids_and_notifies() {
        let fx = fixture("20251014120000aa-w4").await;
        let writer = fx.writer("batches");
        let schema = writer.schema().unwrap();
        let queue = fx.hub.register("batches", &schema);

        let first = writer.publish(&wrap_payload(&batch_payload(0))).unwrap();
        let second = writer.publish(&wrap_payload(&batch_payload(100))).unwrap();
        assert!(second > first);

        assert_eq!(queue.take(Duration::from_millis(10)).await, Some(first));
        assert_eq!(queue.take(Duration::from_millis(10)).await, Some(second));
        assert_eq!(fx.monitor.counter(COUNTER_PUBLISHED), 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_all_commit() {
        let fx = fixture("20251014120000aa-w5").await;
        let writer_a = fx.writer("batches");
        let writer_b = fx.writer("batches");

        let mut handles = Vec::new();
        for (i, writer) in [writer_a, writer_b].into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                for j in 0..5 {
                    let payload = batch_payload((i as i64 * 1000 + j) * 100);
                    writer.publish_async(wrap_payload(&payload)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(fx.monitor.counter(COUNTER_PUBLISHED), 10);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = fixture("20251014120000aa-w6").await;
        let writer = fx.writer("batches");
        writer.close();
        writer.close();
        assert!(matches!(
            writer.publish(&wrap_payload(&batch_payload(0))),
            Err(TopicError::Closed)
        ));
    }
}
