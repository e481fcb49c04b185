//! Application configuration
//!
//! Layered resolution, lowest priority first:
//! 1. built-in defaults
//! 2. profile config (`~/.vivarium/vivarium.json`)
//! 3. local `vivarium.json` OR a CLI-specified config path
//! 4. CLI arguments (with env-var fallbacks via clap)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_CLAIM_TIMEOUT_SECS,
    DEFAULT_DISCOVERY_MAX_POLL_DURATION_MS, DEFAULT_DISCOVERY_POLL_INTERVAL_MS,
    DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_INSERT_BATCH_SIZE, DEFAULT_METADATA_MAX_POLL_DURATION_MS,
    DEFAULT_METADATA_POLL_INTERVAL_MS, DEFAULT_METRICS_WINDOW_MS, DEFAULT_PERSISTENCE_BATCH_SIZE,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::data::codec::BlobCodec;
use crate::utils::file::expand_path;
use crate::wire::EnvironmentSpec;

// =============================================================================
// File config (every field optional, sections mergeable)
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStorageConfig {
    /// Blob-store root; supports `${VAR}` and `~` expansion.
    pub root_directory: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDatabaseConfig {
    /// Seconds before an unacknowledged claim may be reassigned; 0 disables.
    pub claim_timeout: Option<u64>,
    pub metrics_window_size_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexerConfig {
    pub run_id: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub max_poll_duration_ms: Option<u64>,
    pub metadata_file_poll_interval_ms: Option<u64>,
    pub metadata_file_max_poll_duration_ms: Option<u64>,
    pub insert_batch_size: Option<usize>,
    pub flush_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePersistenceConfig {
    pub enabled: Option<bool>,
    pub batch_size: Option<usize>,
    pub flush_timeout_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub codec: Option<BlobCodec>,
    pub dimensions: Option<i32>,
    pub shape: Option<Vec<i64>>,
    pub toroidal: Option<Vec<bool>>,
    pub initial_seed: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileConfig {
    pub storage: Option<FileStorageConfig>,
    pub database: Option<FileDatabaseConfig>,
    pub indexer: Option<FileIndexerConfig>,
    pub persistence: Option<FilePersistenceConfig>,
    /// Per-service port-binding overrides.
    pub bindings: Option<HashMap<String, HashMap<String, String>>>,

    #[serde(flatten)]
    unknown: serde_json::Map<String, serde_json::Value>,
}

impl FileConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn warn_unknown_fields(&self) {
        for key in self.unknown.keys() {
            tracing::warn!(%key, "Unknown config field ignored");
        }
    }

    /// Overlay `other` on top of self, section by section.
    pub fn merge(&mut self, other: FileConfig) {
        merge_section(&mut self.storage, other.storage, |base, over| {
            merge_field(&mut base.root_directory, over.root_directory);
        });
        merge_section(&mut self.database, other.database, |base, over| {
            merge_field(&mut base.claim_timeout, over.claim_timeout);
            merge_field(&mut base.metrics_window_size_ms, over.metrics_window_size_ms);
        });
        merge_section(&mut self.indexer, other.indexer, |base, over| {
            merge_field(&mut base.run_id, over.run_id);
            merge_field(&mut base.poll_interval_ms, over.poll_interval_ms);
            merge_field(&mut base.max_poll_duration_ms, over.max_poll_duration_ms);
            merge_field(
                &mut base.metadata_file_poll_interval_ms,
                over.metadata_file_poll_interval_ms,
            );
            merge_field(
                &mut base.metadata_file_max_poll_duration_ms,
                over.metadata_file_max_poll_duration_ms,
            );
            merge_field(&mut base.insert_batch_size, over.insert_batch_size);
            merge_field(&mut base.flush_timeout_ms, over.flush_timeout_ms);
        });
        merge_section(&mut self.persistence, other.persistence, |base, over| {
            merge_field(&mut base.enabled, over.enabled);
            merge_field(&mut base.batch_size, over.batch_size);
            merge_field(&mut base.flush_timeout_ms, over.flush_timeout_ms);
            merge_field(&mut base.queue_capacity, over.queue_capacity);
            merge_field(&mut base.codec, over.codec);
            merge_field(&mut base.dimensions, over.dimensions);
            merge_field(&mut base.shape, over.shape);
            merge_field(&mut base.toroidal, over.toroidal);
            merge_field(&mut base.initial_seed, over.initial_seed);
        });
        if let Some(bindings) = other.bindings {
            let base = self.bindings.get_or_insert_with(HashMap::new);
            for (service, ports) in bindings {
                base.entry(service).or_default().extend(ports);
            }
        }
    }
}

fn merge_field<T>(base: &mut Option<T>, over: Option<T>) {
    if over.is_some() {
        *base = over;
    }
}

fn merge_section<T: Default>(
    base: &mut Option<T>,
    over: Option<T>,
    apply: impl FnOnce(&mut T, T),
) {
    if let Some(over) = over {
        apply(base.get_or_insert_with(T::default), over);
    }
}

// =============================================================================
// Resolved config
// =============================================================================

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub run_id: Option<String>,
    pub poll_interval: Duration,
    pub max_poll_duration: Duration,
    pub metadata_file_poll_interval: Duration,
    pub metadata_file_max_poll_duration: Duration,
    pub insert_batch_size: usize,
    pub flush_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub batch_size: usize,
    pub flush_timeout: Duration,
    pub queue_capacity: usize,
    pub codec: BlobCodec,
    pub environment: EnvironmentSpec,
    pub initial_seed: i64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Raw data-dir override handed to `AppStorage`.
    pub data_dir: Option<String>,
    /// Blob-store root; `None` means the data dir's `runs/` subdirectory.
    pub storage_root: Option<PathBuf>,
    pub claim_timeout: Duration,
    pub metrics_window_ms: u64,
    pub indexer: IndexerSettings,
    pub persistence: PersistenceSettings,
    /// Effective per-service port bindings (defaults + file overrides).
    pub bindings: HashMap<String, HashMap<String, String>>,
}

/// Built-in binding set wiring the stock services to the stock resources.
pub fn default_bindings() -> HashMap<String, HashMap<String, String>> {
    let entry = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>()
    };
    HashMap::from([
        (
            "persistence".to_string(),
            entry(&[
                ("input", "queue-in:engine-queue"),
                ("storage", "storage-write:run-store"),
                ("batches", "topic-write:batch-topic"),
                ("metadata", "topic-write:metadata-topic"),
            ]),
        ),
        (
            "metadata-indexer".to_string(),
            entry(&[
                ("database", "database-metadata:run-database"),
                ("storage", "storage-read:run-store"),
                (
                    "topic",
                    "topic-read:metadata-topic?consumerGroup=metadata-indexer",
                ),
            ]),
        ),
        (
            "organism-indexer".to_string(),
            entry(&[
                ("database", "database-organism:run-database"),
                ("storage", "storage-read:run-store"),
                (
                    "topic",
                    "topic-read:batch-topic?consumerGroup=organism-indexer",
                ),
            ]),
        ),
        (
            "environment-indexer".to_string(),
            entry(&[
                ("database", "database-environment:run-database"),
                ("storage", "storage-read:run-store"),
                (
                    "topic",
                    "topic-read:batch-topic?consumerGroup=environment-indexer",
                ),
            ]),
        ),
    ])
}

fn profile_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}

impl AppConfig {
    /// Load configuration from all sources.
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");

        let mut file_config = FileConfig::default();
        let mut found_configs: Vec<String> = Vec::new();

        if let Some(profile_path) = profile_config_path()
            && profile_path.exists()
        {
            let profile = FileConfig::load_from_file(&profile_path)?;
            profile.warn_unknown_fields();
            file_config.merge(profile);
            found_configs.push(profile_path.display().to_string());
        }

        let overlay_path = if let Some(path) = &cli.config {
            let expanded = expand_path(&path.to_string_lossy());
            if !expanded.exists() {
                anyhow::bail!("Config file not found: {}", expanded.display());
            }
            Some(expanded)
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };
        if let Some(path) = overlay_path {
            let overlay = FileConfig::load_from_file(&path)?;
            overlay.warn_unknown_fields();
            file_config.merge(overlay);
            found_configs.push(path.display().to_string());
        }

        tracing::debug!(configs = ?found_configs, "Config files loaded");
        Ok(Self::resolve(cli, file_config))
    }

    /// Layer defaults, file config and CLI/env overrides.
    pub fn resolve(cli: &CliConfig, file_config: FileConfig) -> Self {
        let file_storage = file_config.storage.unwrap_or_default();
        let file_database = file_config.database.unwrap_or_default();
        let file_indexer = file_config.indexer.unwrap_or_default();
        let file_persistence = file_config.persistence.unwrap_or_default();

        let storage_root = cli
            .storage_root
            .clone()
            .or(file_storage.root_directory)
            .map(|raw| expand_path(&raw));

        let claim_timeout_secs = cli
            .claim_timeout_secs
            .or(file_database.claim_timeout)
            .unwrap_or(DEFAULT_CLAIM_TIMEOUT_SECS);

        let indexer = IndexerSettings {
            run_id: cli.run_id.clone().or(file_indexer.run_id),
            poll_interval: Duration::from_millis(
                file_indexer
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_DISCOVERY_POLL_INTERVAL_MS),
            ),
            max_poll_duration: Duration::from_millis(
                file_indexer
                    .max_poll_duration_ms
                    .unwrap_or(DEFAULT_DISCOVERY_MAX_POLL_DURATION_MS),
            ),
            metadata_file_poll_interval: Duration::from_millis(
                file_indexer
                    .metadata_file_poll_interval_ms
                    .unwrap_or(DEFAULT_METADATA_POLL_INTERVAL_MS),
            ),
            metadata_file_max_poll_duration: Duration::from_millis(
                file_indexer
                    .metadata_file_max_poll_duration_ms
                    .unwrap_or(DEFAULT_METADATA_MAX_POLL_DURATION_MS),
            ),
            insert_batch_size: file_indexer
                .insert_batch_size
                .unwrap_or(DEFAULT_INSERT_BATCH_SIZE),
            flush_timeout: Duration::from_millis(
                file_indexer.flush_timeout_ms.unwrap_or(DEFAULT_FLUSH_TIMEOUT_MS),
            ),
        };

        let persistence = PersistenceSettings {
            enabled: if cli.no_persistence {
                false
            } else {
                file_persistence.enabled.unwrap_or(true)
            },
            batch_size: file_persistence
                .batch_size
                .unwrap_or(DEFAULT_PERSISTENCE_BATCH_SIZE),
            flush_timeout: Duration::from_millis(
                file_persistence
                    .flush_timeout_ms
                    .unwrap_or(DEFAULT_FLUSH_TIMEOUT_MS),
            ),
            queue_capacity: file_persistence
                .queue_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            codec: file_persistence.codec.unwrap_or_default(),
            environment: EnvironmentSpec {
                dimensions: file_persistence.dimensions.unwrap_or(2),
                shape: file_persistence.shape.unwrap_or_else(|| vec![120, 80]),
                toroidal: file_persistence.toroidal.unwrap_or_else(|| vec![true, true]),
            },
            initial_seed: file_persistence.initial_seed.unwrap_or(0),
        };

        let mut bindings = default_bindings();
        if let Some(overrides) = file_config.bindings {
            for (service, ports) in overrides {
                bindings.entry(service).or_default().extend(ports);
            }
        }

        Self {
            data_dir: cli.data_dir.clone(),
            storage_root,
            claim_timeout: Duration::from_secs(claim_timeout_secs),
            metrics_window_ms: file_database
                .metrics_window_size_ms
                .unwrap_or(DEFAULT_METRICS_WINDOW_MS),
            indexer,
            persistence,
            bindings,
        }
    }

    /// JSON summary for `check-config`.
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "dataDir": self.data_dir,
            "storageRoot": self.storage_root.as_ref().map(|p| p.display().to_string()),
            "claimTimeoutSecs": self.claim_timeout.as_secs(),
            "metricsWindowSizeMs": self.metrics_window_ms,
            "indexer": {
                "runId": self.indexer.run_id,
                "pollIntervalMs": self.indexer.poll_interval.as_millis() as u64,
                "maxPollDurationMs": self.indexer.max_poll_duration.as_millis() as u64,
                "metadataFilePollIntervalMs":
                    self.indexer.metadata_file_poll_interval.as_millis() as u64,
                "metadataFileMaxPollDurationMs":
                    self.indexer.metadata_file_max_poll_duration.as_millis() as u64,
                "insertBatchSize": self.indexer.insert_batch_size,
                "flushTimeoutMs": self.indexer.flush_timeout.as_millis() as u64,
            },
            "persistence": {
                "enabled": self.persistence.enabled,
                "batchSize": self.persistence.batch_size,
                "queueCapacity": self.persistence.queue_capacity,
                "codec": self.persistence.codec.to_string(),
            },
            "bindings": self.bindings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let config = AppConfig::resolve(&CliConfig::default(), FileConfig::default());
        assert_eq!(config.claim_timeout, Duration::from_secs(DEFAULT_CLAIM_TIMEOUT_SECS));
        assert_eq!(config.indexer.poll_interval, Duration::from_millis(1_000));
        assert_eq!(config.indexer.max_poll_duration, Duration::from_millis(300_000));
        assert!(config.persistence.enabled);
        assert_eq!(config.persistence.codec, BlobCodec::Zstd);
        assert!(config.bindings.contains_key("organism-indexer"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: FileConfig = serde_json::from_str(
            r#"{ "database": { "claimTimeout": 120 }, "indexer": { "runId": "file-run" } }"#,
        )
        .unwrap();
        let cli = CliConfig {
            claim_timeout_secs: Some(0),
            run_id: Some("cli-run".into()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, file);
        assert_eq!(config.claim_timeout, Duration::ZERO);
        assert_eq!(config.indexer.run_id.as_deref(), Some("cli-run"));
    }

    #[test]
    fn test_no_persistence_flag_wins() {
        let file: FileConfig =
            serde_json::from_str(r#"{ "persistence": { "enabled": true } }"#).unwrap();
        let cli = CliConfig {
            no_persistence: true,
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, file);
        assert!(!config.persistence.enabled);
    }

    #[test]
    fn test_merge_overlays_fields() {
        let mut base: FileConfig = serde_json::from_str(
            r#"{ "database": { "claimTimeout": 30, "metricsWindowSizeMs": 1000 } }"#,
        )
        .unwrap();
        let overlay: FileConfig =
            serde_json::from_str(r#"{ "database": { "claimTimeout": 99 } }"#).unwrap();
        base.merge(overlay);

        let database = base.database.unwrap();
        assert_eq!(database.claim_timeout, Some(99));
        assert_eq!(database.metrics_window_size_ms, Some(1000));
    }

    #[test]
    fn test_binding_overrides_merge_per_port() {
        let file: FileConfig = serde_json::from_str(
            r#"{ "bindings": { "organism-indexer": {
                "topic": "topic-read:batch-topic?consumerGroup=custom" } } }"#,
        )
        .unwrap();
        let config = AppConfig::resolve(&CliConfig::default(), file);
        let ports = &config.bindings["organism-indexer"];
        assert!(ports["topic"].ends_with("consumerGroup=custom"));
        // untouched ports keep their defaults
        assert_eq!(ports["database"], "database-organism:run-database");
    }

    #[test]
    fn test_unknown_fields_survive_parse() {
        let file: FileConfig =
            serde_json::from_str(r#"{ "surprise": 1, "storage": {} }"#).unwrap();
        assert_eq!(file.unknown.len(), 1);
        file.warn_unknown_fields();
    }

    #[test]
    fn test_storage_root_expands_vars() {
        // SAFETY: no concurrent access to this test-only variable
        unsafe { std::env::set_var("VIVARIUM_CFG_TEST_ROOT", "/srv/sim") };
        let file: FileConfig = serde_json::from_str(
            r#"{ "storage": { "rootDirectory": "${VIVARIUM_CFG_TEST_ROOT}/runs" } }"#,
        )
        .unwrap();
        let config = AppConfig::resolve(&CliConfig::default(), file);
        assert_eq!(config.storage_root, Some(PathBuf::from("/srv/sim/runs")));
    }
}
