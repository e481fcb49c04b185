//! Run discovery
//!
//! An indexer either gets an explicit run id (post-mortem mode) or discovers
//! one live: it records its own start time and polls the blob store for the
//! first run whose run-id timestamp is newer than that. Discovery is bounded
//! by `max_poll_duration`; hitting the bound is a fatal `DISCOVERY_TIMEOUT`.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::data::blobs::{RunStore, StorageError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no simulation run appeared within {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("discovery cancelled")]
    Cancelled,

    #[error("storage listing failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct RunDiscovery {
    /// Post-mortem mode when set.
    pub run_id: Option<String>,
    pub poll_interval: Duration,
    pub max_poll_duration: Duration,
}

impl RunDiscovery {
    /// Resolve the run id to index.
    ///
    /// `started_at_ms` is the indexer's own start time; only runs that begin
    /// strictly after it are considered in live mode.
    pub async fn discover(
        &self,
        store: &dyn RunStore,
        started_at_ms: i64,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<String, DiscoveryError> {
        if let Some(run_id) = &self.run_id {
            tracing::debug!(%run_id, "Using explicit run id");
            return Ok(run_id.clone());
        }

        let started = Instant::now();
        loop {
            if *cancel.borrow() {
                return Err(DiscoveryError::Cancelled);
            }

            match store.list_run_ids(started_at_ms).await {
                Ok(runs) => {
                    if let Some(run_id) = runs.into_iter().next() {
                        tracing::info!(%run_id, "Discovered simulation run");
                        return Ok(run_id);
                    }
                }
                Err(e) => {
                    // transient: keep polling within the bound
                    tracing::warn!(error = %e, "Run listing failed, retrying");
                }
            }

            let waited = started.elapsed();
            if waited >= self.max_poll_duration {
                return Err(DiscoveryError::Timeout {
                    waited_ms: waited.as_millis() as u64,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::data::blobs::{format_run_prefix, metadata_key, FilesystemRunStore};

    fn cancel_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_explicit_run_id_skips_polling() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());
        let (_tx, rx) = cancel_channel();

        let discovery = RunDiscovery {
            run_id: Some("explicit-run".into()),
            poll_interval: Duration::from_millis(10),
            max_poll_duration: Duration::from_millis(50),
        };
        let run = discovery.discover(&store, 0, rx).await.unwrap();
        assert_eq!(run, "explicit-run");
    }

    #[tokio::test]
    async fn test_live_discovery_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());
        let (_tx, rx) = cancel_channel();

        let discovery = RunDiscovery {
            run_id: None,
            poll_interval: Duration::from_millis(10),
            max_poll_duration: Duration::from_millis(60),
        };
        assert!(matches!(
            discovery.discover(&store, 0, rx).await,
            Err(DiscoveryError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_live_discovery_finds_new_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemRunStore::new(dir.path()));
        let (_tx, rx) = cancel_channel();

        let t_new = Utc.with_ymd_and_hms(2025, 10, 14, 12, 0, 10).unwrap();
        let run_id = format!("{}-{}", format_run_prefix(t_new), Uuid::new_v4());

        let writer = {
            let store = Arc::clone(&store);
            let run_id = run_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                store.write_message(&metadata_key(&run_id), b"m").await.unwrap();
            })
        };

        let discovery = RunDiscovery {
            run_id: None,
            poll_interval: Duration::from_millis(10),
            max_poll_duration: Duration::from_secs(5),
        };
        let t0 = Utc.with_ymd_and_hms(2025, 10, 14, 12, 0, 0).unwrap();
        let discovered = discovery
            .discover(store.as_ref(), t0.timestamp_millis(), rx)
            .await
            .unwrap();
        assert_eq!(discovered, run_id);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemRunStore::new(dir.path());
        let (tx, rx) = cancel_channel();

        let discovery = RunDiscovery {
            run_id: None,
            poll_interval: Duration::from_millis(10),
            max_poll_duration: Duration::from_secs(30),
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });
        assert!(matches!(
            discovery.discover(&store, 0, rx).await,
            Err(DiscoveryError::Cancelled)
        ));
    }
}
