//! Topic reader delegate
//!
//! Implements the competing-consumer dispatch: wait on the topic's wake-up
//! queue, scan for claimable candidates in `id` order, and claim the first
//! one that an INSERT or guarded UPDATE wins. The engine has no SKIP LOCKED,
//! so the INSERT/UPDATE pair reproduces its guarantees at statement
//! granularity: each statement is atomic, and affecting exactly one row is
//! the claim.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use duckdb::Connection;
use parking_lot::Mutex;
use prost::Message;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::TopicError;
use super::notify::{NotificationHub, WakeQueue};
use super::{
    AckToken, TopicMessage, COUNTER_ACKNOWLEDGED, COUNTER_CLAIM_CONFLICTS, COUNTER_RECEIVED,
    COUNTER_STALE_ACKS, COUNTER_STUCK_REASSIGNED,
};
use crate::core::constants::{CLAIM_RETRY_WAIT_MS, CLAIM_SCAN_LIMIT};
use crate::data::error::codes;
use crate::data::relational::schema::{ensure_schema, ensure_topic_tables, schema_for_run};
use crate::services::monitor::ResourceMonitor;
use crate::utils::time::now_ms;
use crate::wire::{unwrap_envelope, TopicEnvelope};

struct ReaderBinding {
    run_id: String,
    schema: String,
    wake: Arc<WakeQueue>,
    scan_sql: String,
    insert_claim_sql: String,
    update_claim_sql: String,
    ack_lookup_sql: String,
    ack_merge_sql: String,
    ack_reset_sql: String,
}

/// One row returned by the candidate scan.
struct Candidate {
    row_id: i64,
    message_id: String,
    envelope: Vec<u8>,
    /// The group row exists (claim must go through the UPDATE path).
    has_group_row: bool,
    /// Previous claim time; `Some` means this is a reassignment of a stuck
    /// claim.
    prior_claimed_at: Option<i64>,
}

enum ClaimOutcome {
    Claimed(TopicMessage),
    /// Candidates existed but every claim attempt lost the race.
    LostRace,
    Empty,
}

/// Consuming delegate for one topic and consumer group.
pub struct TopicReader {
    topic: String,
    group: String,
    consumer_id: String,
    claim_timeout: Duration,
    conn: Mutex<Connection>,
    hub: Arc<NotificationHub>,
    monitor: Arc<ResourceMonitor>,
    binding: Mutex<Option<Arc<ReaderBinding>>>,
    closed: AtomicBool,
}

impl TopicReader {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        claim_timeout: Duration,
        conn: Connection,
        hub: Arc<NotificationHub>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer_id: format!("{}:{}", Uuid::new_v4(), std::process::id()),
            claim_timeout,
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

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Bind to a run: install schema + tables, register the wake-up queue,
    /// render the statement set. Idempotent for the same run id.
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
        let wake = self.hub.register(&self.topic, &schema);

        let scan_sql = format!(
            "SELECT m.id, m.message_id, m.envelope,
                    g.message_id IS NOT NULL, g.claimed_at
             FROM {schema}.topic_messages m
             LEFT JOIN {schema}.topic_consumer_group g
               ON g.topic_name = m.topic_name
              AND g.message_id = m.message_id
              AND g.consumer_group = ?
             WHERE m.topic_name = ?
               AND (g.message_id IS NULL
                    OR (g.acknowledged_at IS NULL
                        AND (g.claimed_at IS NULL OR g.claimed_at < ?)))
             ORDER BY m.id
             LIMIT {CLAIM_SCAN_LIMIT}"
        );
        let insert_claim_sql = format!(
            "INSERT INTO {schema}.topic_consumer_group
                 (topic_name, consumer_group, message_id, claimed_by, claimed_at, claim_version)
             VALUES (?, ?, ?, ?, ?, 1)
             ON CONFLICT DO NOTHING"
        );
        let update_claim_sql = format!(
            "UPDATE {schema}.topic_consumer_group
             SET claimed_by = ?, claimed_at = ?, claim_version = claim_version + 1
             WHERE topic_name = ? AND consumer_group = ? AND message_id = ?
               AND acknowledged_at IS NULL
               AND (claimed_at IS NULL OR claimed_at < ?)
             RETURNING claim_version"
        );
        let ack_lookup_sql =
            format!("SELECT message_id FROM {schema}.topic_messages WHERE id = ?");
        let ack_merge_sql = format!(
            "INSERT INTO {schema}.topic_consumer_group
                 (topic_name, consumer_group, message_id, claimed_by, claimed_at,
                  claim_version, acknowledged_at)
             VALUES (?, ?, ?, NULL, NULL, ?, ?)
             ON CONFLICT (topic_name, consumer_group, message_id)
             DO UPDATE SET acknowledged_at = excluded.acknowledged_at"
        );
        let ack_reset_sql = format!(
            "UPDATE {schema}.topic_consumer_group
             SET claimed_by = NULL, claimed_at = NULL
             WHERE topic_name = ? AND consumer_group = ? AND message_id = ?
               AND claim_version = ?"
        );

        tracing::debug!(
            topic = %self.topic,
            group = %self.group,
            consumer = %self.consumer_id,
            %schema,
            "Topic reader bound"
        );
        *binding = Some(Arc::new(ReaderBinding {
            run_id: run_id.to_string(),
            schema,
            wake,
            scan_sql,
            insert_claim_sql,
            update_claim_sql,
            ack_lookup_sql,
            ack_merge_sql,
            ack_reset_sql,
        }));
        Ok(())
    }

    fn binding(&self) -> Result<Arc<ReaderBinding>, TopicError> {
        self.binding.lock().clone().ok_or(TopicError::NotBound)
    }

    /// Receive the next message for this group, blocking up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout without side effects. Scan failures are
    /// recorded on the resource and also surface as `None`; the caller
    /// retries on the next notification. Deserialization failures propagate.
    pub async fn receive(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Option<TopicMessage>, TopicError> {
        let deadline = Instant::now() + timeout;
        let binding = self.binding()?;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TopicError::Closed);
            }

            let reader = Arc::clone(self);
            let outcome = tokio::task::spawn_blocking(move || reader.try_claim())
                .await
                .map_err(|e| TopicError::Task(e.to_string()))?;

            let wait = match outcome {
                Ok(ClaimOutcome::Claimed(message)) => return Ok(Some(message)),
                Ok(ClaimOutcome::LostRace) => Duration::from_millis(CLAIM_RETRY_WAIT_MS),
                Ok(ClaimOutcome::Empty) => timeout,
                Err(err @ TopicError::Claim { .. }) => {
                    self.monitor
                        .record_error(codes::CLAIM_FAILED, "candidate scan failed", err.to_string());
                    timeout
                }
                Err(other) => return Err(other),
            };

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            if binding.wake.take(wait.min(remaining)).await.is_none()
                && Instant::now() >= deadline
            {
                return Ok(None);
            }
        }
    }

    /// One scan-and-claim pass over the candidate window.
    fn try_claim(self: Arc<Self>) -> Result<ClaimOutcome, TopicError> {
        let binding = self.binding()?;
        let now = now_ms();
        let cutoff = if self.claim_timeout.is_zero() {
            i64::MIN
        } else {
            now - self.claim_timeout.as_millis() as i64
        };

        let conn = self.conn.lock();
        let claim_err = |source| TopicError::Claim {
            topic: self.topic.clone(),
            source,
        };

        let candidates: Vec<Candidate> = {
            let mut stmt = conn.prepare(&binding.scan_sql).map_err(claim_err)?;
            let rows = stmt
                .query_map(
                    duckdb::params![self.group, self.topic, cutoff],
                    |row| {
                        Ok(Candidate {
                            row_id: row.get(0)?,
                            message_id: row.get(1)?,
                            envelope: row.get(2)?,
                            has_group_row: row.get(3)?,
                            prior_claimed_at: row.get(4)?,
                        })
                    },
                )
                .map_err(claim_err)?;
            rows.collect::<Result<_, _>>().map_err(claim_err)?
        };

        if candidates.is_empty() {
            return Ok(ClaimOutcome::Empty);
        }

        for candidate in candidates {
            let claim_version = match self.attempt_claim(&conn, &binding, &candidate, now, cutoff) {
                Some(version) => version,
                None => {
                    self.monitor.increment(COUNTER_CLAIM_CONFLICTS);
                    continue;
                }
            };

            if candidate.prior_claimed_at.is_some() {
                self.monitor.increment(COUNTER_STUCK_REASSIGNED);
                self.monitor.record_error(
                    codes::STUCK_MESSAGE_REASSIGNED,
                    "stuck claim reassigned",
                    format!(
                        "topic={} group={} message_id={} claim_version={}",
                        self.topic, self.group, candidate.message_id, claim_version
                    ),
                );
            }

            let envelope =
                TopicEnvelope::decode(&candidate.envelope[..]).map_err(|source| {
                    self.monitor.record_error(
                        codes::DESERIALIZATION_ERROR,
                        "stored envelope failed to decode",
                        format!("row_id={}", candidate.row_id),
                    );
                    TopicError::Deserialization {
                        row_id: candidate.row_id,
                        source,
                    }
                })?;
            let payload = unwrap_envelope(&envelope).map_err(|err| {
                self.monitor
                    .record_error(err_code(&err), "envelope unwrap failed", err.to_string());
                TopicError::Envelope(err)
            })?;

            self.monitor.increment(COUNTER_RECEIVED);
            return Ok(ClaimOutcome::Claimed(TopicMessage {
                envelope,
                payload,
                token: AckToken {
                    row_id: candidate.row_id,
                    claim_version,
                },
            }));
        }

        Ok(ClaimOutcome::LostRace)
    }

    /// Try to claim one candidate; `None` means another consumer won.
    fn attempt_claim(
        &self,
        conn: &Connection,
        binding: &ReaderBinding,
        candidate: &Candidate,
        now: i64,
        cutoff: i64,
    ) -> Option<i64> {
        if !candidate.has_group_row {
            match conn.execute(
                &binding.insert_claim_sql,
                duckdb::params![
                    self.topic,
                    self.group,
                    candidate.message_id,
                    self.consumer_id,
                    now
                ],
            ) {
                Ok(1) => return Some(1),
                Ok(_) => {} // conflict, fall through to the update path
                Err(e) => {
                    // a concurrent claim can abort this statement; treat it
                    // as a lost race, the scan retries on the next wake-up
                    tracing::trace!(error = %e, "Claim insert lost");
                    return None;
                }
            }
        }

        match conn.query_row(
            &binding.update_claim_sql,
            duckdb::params![
                self.consumer_id,
                now,
                self.topic,
                self.group,
                candidate.message_id,
                cutoff
            ],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(version) => Some(version),
            Err(duckdb::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                tracing::trace!(error = %e, "Claim update lost");
                None
            }
        }
    }

    /// Acknowledge a received message.
    ///
    /// Runs resolve + ack MERGE + guarded claim reset in one transaction;
    /// a version mismatch rolls everything back and is reported as
    /// [`TopicError::StaleAck`].
    pub fn ack(&self, message: &TopicMessage) -> Result<(), TopicError> {
        let binding = self.binding()?;
        let token = message.token();
        let conn = self.conn.lock();

        let tx_err = |source| TopicError::AckTransaction {
            row_id: token.row_id,
            source,
        };

        conn.execute_batch("BEGIN TRANSACTION").map_err(tx_err)?;
        let result = self.ack_in_tx(&conn, &binding, token);
        match &result {
            Ok(()) => {
                conn.execute_batch("COMMIT").map_err(tx_err)?;
                self.monitor.increment(COUNTER_ACKNOWLEDGED);
            }
            Err(_) => {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!("ROLLBACK failed after ack error: {}", e);
                }
            }
        }

        if let Err(TopicError::StaleAck { row_id, claim_version }) = &result {
            self.monitor.increment(COUNTER_STALE_ACKS);
            self.monitor.record_error(
                codes::STALE_ACK_REJECTED,
                "ack rejected, claim was reassigned",
                format!("row_id={row_id} claim_version={claim_version}"),
            );
        }
        result
    }

    fn ack_in_tx(
        &self,
        conn: &Connection,
        binding: &ReaderBinding,
        token: AckToken,
    ) -> Result<(), TopicError> {
        let message_id: String = conn
            .query_row(
                &binding.ack_lookup_sql,
                duckdb::params![token.row_id],
                |row| row.get(0),
            )
            .map_err(|source| match source {
                duckdb::Error::QueryReturnedNoRows => {
                    self.monitor.record_error(
                        codes::ACK_LOOKUP_FAILED,
                        "ack token row not found",
                        format!("row_id={}", token.row_id),
                    );
                    TopicError::AckLookup {
                        row_id: token.row_id,
                    }
                }
                other => TopicError::AckTransaction {
                    row_id: token.row_id,
                    source: other,
                },
            })?;

        conn.execute(
            &binding.ack_merge_sql,
            duckdb::params![
                self.topic,
                self.group,
                message_id,
                token.claim_version,
                now_ms()
            ],
        )
        .map_err(|source| TopicError::AckTransaction {
            row_id: token.row_id,
            source,
        })?;

        let reset = conn
            .execute(
                &binding.ack_reset_sql,
                duckdb::params![self.topic, self.group, message_id, token.claim_version],
            )
            .map_err(|source| TopicError::AckTransaction {
                row_id: token.row_id,
                source,
            })?;

        if reset == 0 {
            return Err(TopicError::StaleAck {
                row_id: token.row_id,
                claim_version: token.claim_version,
            });
        }
        Ok(())
    }

    /// Acknowledge from async context by offloading the blocking transaction.
    pub async fn ack_async(self: &Arc<Self>, message: TopicMessage) -> Result<(), TopicError> {
        let reader = Arc::clone(self);
        tokio::task::spawn_blocking(move || reader.ack(&message))
            .await
            .map_err(|e| TopicError::Task(e.to_string()))?
    }

    /// Close the delegate. Idempotent; a blocked receive observes the flag
    /// at its next scan.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                topic = %self.topic,
                group = %self.group,
                consumer = %self.consumer_id,
                "Topic reader closed"
            );
        }
    }

    /// Schema this reader is bound to, if bound.
    pub fn schema(&self) -> Option<String> {
        self.binding.lock().as_ref().map(|b| b.schema.clone())
    }
}

fn err_code(err: &crate::wire::EnvelopeError) -> &'static str {
    match err {
        crate::wire::EnvelopeError::UnknownType(_) => codes::UNKNOWN_TYPE,
        _ => codes::DESERIALIZATION_ERROR,
    }
}
