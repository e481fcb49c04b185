//! Relational database service
//!
//! Owns the embedded DuckDB database that backs both the durable topic
//! engine and the per-run index schemas. The service holds one root
//! connection; every delegate (topic reader/writer, indexer database
//! handle) clones its own dedicated connection from it and keeps that
//! connection for its whole lifetime.

pub mod schema;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use duckdb::Connection;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{DATABASE_CHECKPOINT_INTERVAL_SECS, DATABASE_QUERY_TIMEOUT_SECS};
use crate::data::error::DataError;

/// Embedded relational database service.
///
/// Uses a root connection protected by a mutex; blocking work is offloaded
/// through [`RelationalService::run_query`].
pub struct RelationalService {
    conn: Mutex<Option<Connection>>,
}

impl Drop for RelationalService {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take()
            && let Err((_, e)) = conn.close()
        {
            tracing::warn!("Database connection close failed during drop: {}", e);
        }
    }
}

impl RelationalService {
    /// Open (or create) the database file and apply session settings.
    pub async fn init(db_path: &Path) -> Result<Self, DataError> {
        let path = db_path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                "SET autoinstall_known_extensions = false;
                 SET autoload_known_extensions = false;
                 PRAGMA enable_checkpoint_on_shutdown;
                 LOAD json;",
            )?;
            Ok::<_, duckdb::Error>(conn)
        })
        .await
        .map_err(|e| DataError::Io(std::io::Error::other(e)))??;

        tracing::debug!(path = %db_path.display(), "RelationalService initialized");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Get exclusive access to the root connection.
    ///
    /// # Panics
    /// Panics if the connection has been closed via `close()`.
    pub fn conn(&self) -> parking_lot::MappedMutexGuard<'_, Connection> {
        MutexGuard::map(self.conn.lock(), |opt| {
            opt.as_mut()
                .expect("database connection already closed - do not call conn() after close()")
        })
    }

    /// Clone a dedicated connection for a delegate.
    ///
    /// The returned connection shares the database instance but none of the
    /// root connection's locking, so delegates never contend on the service
    /// mutex.
    pub fn delegate_connection(&self) -> Result<Connection, DataError> {
        Ok(self.conn().try_clone()?)
    }

    /// Check if the connection is still open (test utility only)
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Run a blocking database closure with a timeout.
    pub async fn run_query<T, F>(f: F) -> Result<T, DataError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let timeout = Duration::from_secs(DATABASE_QUERY_TIMEOUT_SECS);
        tokio::time::timeout(timeout, tokio::task::spawn_blocking(f))
            .await
            .map_err(|_| {
                tracing::warn!("Database query timed out after {}s", DATABASE_QUERY_TIMEOUT_SECS);
                DataError::Timeout {
                    timeout_secs: DATABASE_QUERY_TIMEOUT_SECS,
                }
            })?
            .map_err(|e| {
                tracing::error!(error = %e, "Database query task failed");
                DataError::Io(std::io::Error::other(format!("query execution failed: {}", e)))
            })
    }

    /// Flush the WAL into the main database file.
    ///
    /// A no-op once the connection has been closed.
    pub async fn checkpoint(self: &Arc<Self>) -> Result<(), DataError> {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let conn_guard = db.conn.lock();
            if let Some(ref conn) = *conn_guard {
                conn.execute("CHECKPOINT", [])?;
                tracing::debug!("Database checkpoint completed");
            }
            Ok(())
        })
        .await
        .map_err(|e| DataError::Io(std::io::Error::other(e)))?
    }

    /// Close the root connection gracefully.
    pub async fn close(self: Arc<Self>) -> Result<(), DataError> {
        tokio::task::spawn_blocking(move || {
            let mut conn_guard = self.conn.lock();
            if let Some(conn) = conn_guard.take() {
                if let Err(e) = conn.execute("CHECKPOINT", []) {
                    tracing::warn!("CHECKPOINT failed during close: {}", e);
                }
                conn.close().map_err(|(_, e)| DataError::Database(e))?;
                tracing::debug!("Database connection closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| DataError::Io(std::io::Error::other(e)))?
    }

    /// Periodic WAL checkpointing until shutdown.
    pub fn start_checkpoint_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let db = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(DATABASE_CHECKPOINT_INTERVAL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Checkpoint task shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = db.checkpoint().await {
                            tracing::warn!("Database checkpoint failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Execute a closure within a transaction, rolling back on error.
pub(crate) fn in_transaction<F, T>(conn: &Connection, f: F) -> Result<T, DataError>
where
    F: FnOnce(&Connection) -> Result<T, DataError>,
{
    conn.execute_batch("BEGIN TRANSACTION")?;
    match f(conn) {
        Ok(val) => {
            conn.execute_batch("COMMIT")?;
            Ok(val)
        }
        Err(e) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("ROLLBACK failed after transaction error: {}", rollback_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn create_test_service() -> (TempDir, Arc<RelationalService>) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = RelationalService::init(&temp_dir.path().join("test.duckdb"))
            .await
            .expect("Failed to init database");
        (temp_dir, Arc::new(service))
    }

    #[tokio::test]
    async fn test_init_and_query() {
        let (_tmp, service) = create_test_service().await;
        let conn = service.conn();
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_delegate_connection_is_independent() {
        let (_tmp, service) = create_test_service().await;
        let delegate = service.delegate_connection().unwrap();

        service
            .conn()
            .execute_batch("CREATE TABLE t (v BIGINT)")
            .unwrap();
        delegate.execute("INSERT INTO t VALUES (7)", []).unwrap();

        let v: i64 = service
            .conn()
            .query_row("SELECT v FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_checkpoint_and_close() {
        let (_tmp, service) = create_test_service().await;
        service.checkpoint().await.unwrap();
        assert!(service.is_open());
        Arc::clone(&service).close().await.unwrap();
        assert!(!service.is_open());
    }

    #[tokio::test]
    async fn test_checkpoint_after_close_is_noop() {
        let (_tmp, service) = create_test_service().await;
        let for_checkpoint = Arc::clone(&service);
        service.close().await.unwrap();
        assert!(for_checkpoint.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_in_transaction_rolls_back() {
        let (_tmp, service) = create_test_service().await;
        let conn = service.conn();
        conn.execute_batch("CREATE TABLE t (v BIGINT)").unwrap();

        let result: Result<(), DataError> = in_transaction(&conn, |conn| {
            conn.execute("INSERT INTO t VALUES (1)", [])?;
            Err(DataError::Config("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
