//! Data layer
//!
//! - `relational` - embedded DuckDB service and per-run schema DDL
//! - `topics` - durable topic engine (publish/subscribe over the database)
//! - `blobs` - protobuf blob store keyed by run id + tick range
//! - `codec` - self-describing compression envelope for blob columns
//! - `error` - unified error type and operational error codes

pub mod blobs;
pub mod codec;
pub mod error;
pub mod relational;
pub mod topics;

pub use error::DataError;
pub use relational::RelationalService;
