//! Unified error type for the data layer

use thiserror::Error;

/// Operational error codes recorded against resources.
///
/// These are stable identifiers surfaced in health output and logs; the
/// corresponding Rust error types carry the detail.
pub mod codes {
    pub const PUBLISH_FAILED: &str = "PUBLISH_FAILED";
    pub const WRITE_FAILED: &str = "WRITE_FAILED";
    pub const CLAIM_FAILED: &str = "CLAIM_FAILED";
    pub const ACK_FAILED: &str = "ACK_FAILED";
    pub const ACK_LOOKUP_FAILED: &str = "ACK_LOOKUP_FAILED";
    pub const RELEASE_CLAIM_FAILED: &str = "RELEASE_CLAIM_FAILED";
    pub const ACK_TRANSACTION_FAILED: &str = "ACK_TRANSACTION_FAILED";
    pub const STALE_ACK_REJECTED: &str = "STALE_ACK_REJECTED";
    pub const STUCK_MESSAGE_REASSIGNED: &str = "STUCK_MESSAGE_REASSIGNED";
    pub const DESERIALIZATION_ERROR: &str = "DESERIALIZATION_ERROR";
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
    pub const SCHEMA_SETUP_FAILED: &str = "SCHEMA_SETUP_FAILED";
    pub const SET_SCHEMA_FAILED: &str = "SET_SCHEMA_FAILED";
    pub const CREATE_SCHEMA_FAILED: &str = "CREATE_SCHEMA_FAILED";
    pub const INSERT_METADATA_FAILED: &str = "INSERT_METADATA_FAILED";
    pub const DISCOVERY_TIMEOUT: &str = "DISCOVERY_TIMEOUT";
    pub const POOL_CLOSE_FAILED: &str = "POOL_CLOSE_FAILED";
    pub const DELEGATE_CLOSE_FAILED: &str = "DELEGATE_CLOSE_FAILED";
}

/// Unified error type for database operations.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("query timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("invalid run id {run_id:?}: {reason}")]
    InvalidRunId { run_id: String, reason: &'static str },

    #[error("schema setup failed for {schema}: {source}")]
    SchemaSetup {
        schema: String,
        source: duckdb::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = DataError::InvalidRunId {
            run_id: "x!".into(),
            reason: "unexpected character",
        };
        assert!(err.to_string().contains("x!"));
        assert!(err.to_string().contains("unexpected character"));
    }
}
