//! Blob storage for persisted simulation state
//!
//! Stores protobuf blobs keyed by run id + tick range under a root
//! directory:
//!
//! ```text
//! <root>/
//!   <runId>/
//!     metadata.pb
//!     batch_<tickStart>_<tickEnd>.pb    // tick numbers zero-padded to 10 digits
//! ```
//!
//! Run ids have the form `YYYYMMDDHHmmssSS-<UUIDv4>`; run discovery parses
//! the timestamp prefix rather than trusting filesystem metadata.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::core::constants::BATCH_KEY_TICK_WIDTH;

/// Length of the run-id timestamp prefix (`YYYYMMDDHHmmssSS`).
const RUN_ID_PREFIX_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error on {key}: {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },
}

/// Read/write access to the blob store.
///
/// `write_message` is atomic per key; `read_message` fails when the key is
/// absent (callers poll when they expect an eventual arrival);
/// `list_run_ids` never blocks on anything but directory enumeration.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn write_message(&self, key: &str, payload: &[u8]) -> Result<(), StorageError>;

    async fn read_message(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Run ids whose timestamp prefix decodes to a time strictly after
    /// `after_ms`, ascending.
    async fn list_run_ids(&self, after_ms: i64) -> Result<Vec<String>, StorageError>;
}

/// Generate a fresh run id from the current wall clock.
pub fn new_run_id() -> String {
    let now = Utc::now();
    let centis = now.timestamp_subsec_millis() / 10;
    format!(
        "{}{:02}-{}",
        now.format("%Y%m%d%H%M%S"),
        centis,
        Uuid::new_v4()
    )
}

/// Parse the timestamp prefix of a run id into epoch milliseconds.
///
/// Returns `None` for names that do not follow the run-id format, so stray
/// directories under the storage root are skipped rather than fatal.
pub fn run_id_timestamp_ms(run_id: &str) -> Option<i64> {
    let (prefix, rest) = run_id.split_at_checked(RUN_ID_PREFIX_LEN)?;
    if !rest.starts_with('-') || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let seconds = NaiveDateTime::parse_from_str(&prefix[..14], "%Y%m%d%H%M%S").ok()?;
    let centis: i64 = prefix[14..].parse().ok()?;
    Some(seconds.and_utc().timestamp_millis() + centis * 10)
}

/// Storage key of a batch blob for an inclusive tick range.
pub fn batch_key(run_id: &str, tick_start: i64, tick_end: i64) -> String {
    format!(
        "{run_id}/batch_{tick_start:0width$}_{tick_end:0width$}.pb",
        width = BATCH_KEY_TICK_WIDTH
    )
}

/// Storage key of a run's metadata blob.
pub fn metadata_key(run_id: &str) -> String {
    format!("{run_id}/metadata.pb")
}

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct FilesystemRunStore {
    root: PathBuf,
}

impl FilesystemRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a storage key to a path, rejecting traversal outside the root.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl RunStore for FilesystemRunStore {
    async fn write_message(&self, key: &str, payload: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        let io = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }

        // write-then-rename keeps readers from ever observing a partial blob
        let tmp = path.with_extension("pb.tmp");
        tokio::fs::write(&tmp, payload).await.map_err(io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io)?;
        Ok(())
    }

    async fn read_message(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn list_run_ids(&self, after_ms: i64) -> Result<Vec<String>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    key: self.root.display().to_string(),
                    source,
                });
            }
        };

        let mut runs: Vec<(i64, String)> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StorageError::Io {
            key: self.root.display().to_string(),
            source,
        })? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match run_id_timestamp_ms(&name) {
                Some(ts) if ts > after_ms => runs.push((ts, name)),
                Some(_) => {}
                None => tracing::debug!(%name, "Skipping non-run directory in storage root"),
            }
        }

        runs.sort();
        Ok(runs.into_iter().map(|(_, name)| name).collect())
    }
}

/// Format an epoch-ms timestamp as a run-id prefix (test and tooling helper).
pub fn format_run_prefix(at: DateTime<Utc>) -> String {
    format!(
        "{}{:02}",
        at.format("%Y%m%d%H%M%S"),
        at.timestamp_subsec_millis() / 10
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_run_id_parses() {
        let id = new_run_id();
        assert!(run_id_timestamp_ms(&id).is_some());
    }

    #[test]
    fn test_run_id_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 10, 14, 12, 30, 45).unwrap();
        let id = format!("{}-{}", format_run_prefix(at), Uuid::new_v4());
        assert_eq!(run_id_timestamp_ms(&id), Some(at.timestamp_millis()));
    }

    #[test]
    fn test_run_id_rejects_malformed() {
        assert_eq!(run_id_timestamp_ms("not-a-run"), None);
        assert_eq!(run_id_timestamp_ms("2025101412304599"), None); // no uuid part
        assert_eq!(run_id_timestamp_ms("20251399123045 9-x"), None);
        assert_eq!(run_id_timestamp_ms(""), None);
    }

    #[test]
    fn test_batch_key_zero_padded() {
        assert_eq!(
            batch_key("r", 0, 100),
            "r/batch_0000000000_0000000100.pb"
        );
    }

    #[test]
    fn test_metadata_key() {
        assert_eq!(metadata_key("r"), "r/metadata.pb");
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());

        store.write_message("run-a/metadata.pb", b"meta").await.unwrap();
        assert_eq!(store.read_message("run-a/metadata.pb").await.unwrap(), b"meta");
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());
        assert!(matches!(
            store.read_message("nope/metadata.pb").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());

        store.write_message("r/metadata.pb", b"v1").await.unwrap();
        store.write_message("r/metadata.pb", b"v2").await.unwrap();
        assert_eq!(store.read_message("r/metadata.pb").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());
        assert!(matches!(
            store.write_message("../evil.pb", b"x").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.read_message("/etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_list_run_ids_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());

        let t0 = Utc.with_ymd_and_hms(2025, 10, 14, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 10, 14, 12, 0, 1).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 10, 14, 12, 0, 2).unwrap();

        let old = format!("{}-{}", format_run_prefix(t0), Uuid::new_v4());
        let mid = format!("{}-{}", format_run_prefix(t1), Uuid::new_v4());
        let new = format!("{}-{}", format_run_prefix(t2), Uuid::new_v4());

        // create out of order plus one stray directory
        for run in [&new, &old, &mid] {
            store
                .write_message(&metadata_key(run), b"m")
                .await
                .unwrap();
        }
        tokio::fs::create_dir(dir.path().join("lost+found")).await.unwrap();

        let listed = store.list_run_ids(t0.timestamp_millis()).await.unwrap();
        assert_eq!(listed, vec![mid, new]);
    }

    #[tokio::test]
    async fn test_list_run_ids_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path().join("missing"));
        assert!(store.list_run_ids(0).await.unwrap().is_empty());
    }
}
