//! Pipeline domain logic
//!
//! - `persistence` - engine queue → blob store + batch notifications
//! - `indexer` - notification stream → idempotent per-run database writes

pub mod indexer;
pub mod persistence;
