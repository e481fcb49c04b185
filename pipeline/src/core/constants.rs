// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display and platform directories)
pub const APP_NAME: &str = "Vivarium";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "vivarium";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".vivarium";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "vivarium.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "VIVARIUM_CONFIG";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "VIVARIUM_LOG";

/// Environment variable to override the data directory
pub const ENV_DATA_DIR: &str = "VIVARIUM_DATA_DIR";

/// Environment variable to override the blob-store root directory
pub const ENV_STORAGE_ROOT: &str = "VIVARIUM_STORAGE_ROOT";

/// Environment variable to pin an explicit run id (post-mortem indexing)
pub const ENV_RUN_ID: &str = "VIVARIUM_RUN_ID";

/// Environment variable for the topic claim timeout in seconds
pub const ENV_CLAIM_TIMEOUT_SECS: &str = "VIVARIUM_CLAIM_TIMEOUT_SECS";

// =============================================================================
// Database
// =============================================================================

/// Database file name inside the database subdirectory
pub const DATABASE_FILENAME: &str = "vivarium.duckdb";

/// Interval between WAL checkpoints (seconds)
pub const DATABASE_CHECKPOINT_INTERVAL_SECS: u64 = 60;

/// Timeout applied to offloaded blocking queries (seconds)
pub const DATABASE_QUERY_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Topics
// =============================================================================

/// Topic carrying persisted-batch notifications
pub const TOPIC_BATCHES: &str = "persisted-batches";

/// Topic carrying metadata-written notifications
pub const TOPIC_METADATA: &str = "persisted-metadata";

/// Maximum candidate rows examined per claim scan
pub const CLAIM_SCAN_LIMIT: usize = 10;

/// Bounded wake-up queue capacity per (topic, schema) key
pub const WAKEUP_QUEUE_CAPACITY: usize = 1024;

/// Short bounded wait between claim retries after losing every candidate (ms)
pub const CLAIM_RETRY_WAIT_MS: u64 = 50;

/// Default claim timeout before a stuck message is reassigned (seconds);
/// 0 disables reassignment
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// Indexers
// =============================================================================

/// Default interval between run-discovery polls (ms)
pub const DEFAULT_DISCOVERY_POLL_INTERVAL_MS: u64 = 1_000;

/// Default cap on the run-discovery poll loop (ms)
pub const DEFAULT_DISCOVERY_MAX_POLL_DURATION_MS: u64 = 300_000;

/// Default interval between metadata-file polls (ms)
pub const DEFAULT_METADATA_POLL_INTERVAL_MS: u64 = 1_000;

/// Default cap on the metadata-file poll loop (ms)
pub const DEFAULT_METADATA_MAX_POLL_DURATION_MS: u64 = 60_000;

/// Default number of buffered ticks that triggers a flush
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 100;

/// Default age of the oldest pending tick that triggers a flush (ms)
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 1_000;

/// Receive timeout for indexer main loops; bounds the shutdown latency (ms)
pub const INDEXER_RECEIVE_TIMEOUT_MS: u64 = 500;

// =============================================================================
// Persistence
// =============================================================================

/// Default number of ticks written per batch blob
pub const DEFAULT_PERSISTENCE_BATCH_SIZE: usize = 100;

/// Default capacity of the engine-to-persistence queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 4_096;

/// Zero-padding width of tick numbers in batch blob keys
pub const BATCH_KEY_TICK_WIDTH: usize = 10;

// =============================================================================
// Monitoring
// =============================================================================

/// Default sliding-window size for rate metrics (ms)
pub const DEFAULT_METRICS_WINDOW_MS: u64 = 5_000;

/// Number of buckets in a metrics sliding window
pub const METRICS_WINDOW_BUCKETS: usize = 10;

/// Bounded operational error log capacity per resource
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Interval between periodic health reports (seconds)
pub const HEALTH_REPORT_INTERVAL_SECS: u64 = 30;

// =============================================================================
// Shutdown
// =============================================================================

/// Maximum time to wait for background tasks during shutdown (seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 15;
