//! Metadata availability gate
//!
//! Downstream indexers need the environment dimensions before they can
//! interpret per-tick state. The gate blocks `get()` until the metadata
//! indexer has loaded the run metadata at least once; later updates replace
//! the value without blocking anyone.

use tokio::sync::watch;

use crate::wire::SimulationMetadata;

#[derive(Clone)]
pub struct MetadataGate {
    tx: watch::Sender<Option<SimulationMetadata>>,
}

impl Default for MetadataGate {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish loaded metadata, waking every waiter.
    pub fn set(&self, metadata: SimulationMetadata) {
        let _ = self.tx.send(Some(metadata));
    }

    /// Metadata if already loaded, without waiting.
    pub fn peek(&self) -> Option<SimulationMetadata> {
        self.tx.borrow().clone()
    }

    /// Wait until metadata has been loaded at least once.
    ///
    /// `None` only when the gate is dropped while still empty.
    pub async fn get(&self) -> Option<SimulationMetadata> {
        let mut rx = self.tx.subscribe();
        let value = rx.wait_for(|v| v.is_some()).await.ok()?;
        value.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn metadata() -> SimulationMetadata {
        SimulationMetadata {
            simulation_run_id: "r".into(),
            environment: None,
            start_time_ms: 1,
            initial_seed: 42,
        }
    }

    #[tokio::test]
    async fn test_get_blocks_until_set() {
        let gate = MetadataGate::new();
        assert!(gate.peek().is_none());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.get().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        gate.set(metadata());
        let got = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().initial_seed, 42);
    }

    #[tokio::test]
    async fn test_get_returns_immediately_once_set() {
        let gate = MetadataGate::new();
        gate.set(metadata());
        assert!(gate.get().await.is_some());
        assert!(gate.peek().is_some());
    }

    #[tokio::test]
    async fn test_set_replaces_value() {
        let gate = MetadataGate::new();
        gate.set(metadata());
        let mut updated = metadata();
        updated.initial_seed = 7;
        gate.set(updated);
        assert_eq!(gate.peek().unwrap().initial_seed, 7);
    }
}
