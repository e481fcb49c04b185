//! Topic engine error types

use thiserror::Error;

use crate::data::error::DataError;
use crate::wire::EnvelopeError;

/// Error type for topic operations.
#[derive(Error, Debug)]
pub enum TopicError {
    /// The storage engine rejected a publish insert.
    #[error("publish failed on topic {topic}: {source}")]
    Publish {
        topic: String,
        source: duckdb::Error,
    },

    /// The candidate scan or a claim statement failed.
    #[error("claim failed on topic {topic}: {source}")]
    Claim {
        topic: String,
        source: duckdb::Error,
    },

    /// The ack token's row id no longer resolves to a message.
    #[error("ack lookup failed for row {row_id}")]
    AckLookup { row_id: i64 },

    /// The claim was reassigned before the ack arrived.
    #[error("stale ack rejected for row {row_id} (claim version {claim_version})")]
    StaleAck { row_id: i64, claim_version: i64 },

    /// The ack transaction could not be committed; the claim is intact.
    #[error("ack transaction failed for row {row_id}: {source}")]
    AckTransaction {
        row_id: i64,
        source: duckdb::Error,
    },

    /// Schema installation or statement preparation failed.
    #[error("schema binding failed: {0}")]
    Schema(#[from] DataError),

    /// The delegate is already bound to a different run.
    #[error("delegate already bound to run {bound}, refusing rebind to {requested}")]
    RunAlreadyBound { bound: String, requested: String },

    /// The delegate has not been bound to a run yet.
    #[error("delegate not bound to a simulation run")]
    NotBound,

    /// A stored envelope failed to decode.
    #[error("envelope deserialization failed for row {row_id}: {source}")]
    Deserialization {
        row_id: i64,
        source: prost::DecodeError,
    },

    /// Envelope unwrap failed (unknown type URL or missing payload).
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The delegate was closed.
    #[error("topic delegate closed")]
    Closed,

    /// An offloaded blocking task failed to complete.
    #[error("blocking task failed: {0}")]
    Task(String),
}

impl TopicError {
    /// Stable operational code for recording against the owning resource.
    pub fn code(&self) -> &'static str {
        use crate::data::error::codes;
        match self {
            TopicError::Publish { .. } => codes::PUBLISH_FAILED,
            TopicError::Claim { .. } => codes::CLAIM_FAILED,
            TopicError::AckLookup { .. } => codes::ACK_LOOKUP_FAILED,
            TopicError::StaleAck { .. } => codes::STALE_ACK_REJECTED,
            TopicError::AckTransaction { .. } => codes::ACK_TRANSACTION_FAILED,
            TopicError::Schema(_) => codes::SET_SCHEMA_FAILED,
            TopicError::RunAlreadyBound { .. } => codes::SET_SCHEMA_FAILED,
            TopicError::NotBound => codes::SET_SCHEMA_FAILED,
            TopicError::Deserialization { .. } => codes::DESERIALIZATION_ERROR,
            TopicError::Envelope(EnvelopeError::UnknownType(_)) => codes::UNKNOWN_TYPE,
            TopicError::Envelope(_) => codes::DESERIALIZATION_ERROR,
            TopicError::Closed => codes::DELEGATE_CLOSE_FAILED,
            TopicError::Task(_) => codes::CLAIM_FAILED,
        }
    }
}
