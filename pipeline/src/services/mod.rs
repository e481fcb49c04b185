//! Resource & service model
//!
//! Resources are constructed once at process start and wrapped per binding
//! ([`resource`]); services consume the wrapped handles and run through the
//! lifecycle Stopped → Running ↔ Paused → Stopped, with any state moving to
//! Error on a fatal fault. The [`manager`] wires both sides together from
//! binding URIs.

pub mod binding;
pub mod manager;
pub mod monitor;
pub mod queue;
pub mod resource;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::SHUTDOWN_TIMEOUT_SECS;

/// Service lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Stopped,
    Running,
    Paused,
    /// Terminal except via restart.
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Paused => write!(f, "paused"),
            ServiceState::Error => write!(f, "error"),
        }
    }
}

/// A long-running pipeline service.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ServiceState;

    /// Start the service's main loop. No-op unless currently Stopped.
    async fn start(self: Arc<Self>) -> anyhow::Result<()>;

    /// Signal the loop to finish and wait for it.
    async fn stop(&self);

    fn pause(&self);

    fn resume(&self);
}

/// Shared lifecycle plumbing for service implementations: the state cell,
/// the pause gate and the cancellation channel.
pub struct ServiceCore {
    name: String,
    state: Mutex<ServiceState>,
    pause_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ServiceCore {
    pub fn new(name: impl Into<String>) -> Self {
        let (pause_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            state: Mutex::new(ServiceState::Stopped),
            pause_tx,
            cancel_tx,
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ServiceState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(service = %self.name, from = %*current, to = %state, "Service state");
            *current = state;
        }
    }

    /// Attempt the Stopped → Running transition; false when not Stopped.
    pub fn transition_to_running(&self) -> bool {
        let mut current = self.state.lock();
        if *current != ServiceState::Stopped {
            return false;
        }
        *current = ServiceState::Running;
        true
    }

    pub fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn pause(&self) {
        if self.state() == ServiceState::Running {
            let _ = self.pause_tx.send(true);
            self.set_state(ServiceState::Paused);
        }
    }

    pub fn resume(&self) {
        if self.state() == ServiceState::Paused {
            let _ = self.pause_tx.send(false);
            self.set_state(ServiceState::Running);
        }
    }

    /// Block while paused; returns immediately when running or cancelled.
    pub async fn wait_if_paused(&self) {
        let mut pause_rx = self.pause_tx.subscribe();
        let mut cancel_rx = self.cancel_tx.subscribe();
        while *pause_rx.borrow() && !*cancel_rx.borrow() {
            tokio::select! {
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = cancel_rx.changed() => return,
            }
        }
    }

    /// Store the spawned main-loop handle.
    pub async fn attach_task(&self, handle: JoinHandle<()>) {
        *self.task.lock().await = Some(handle);
    }

    /// Signal cancellation and await the main loop (bounded).
    pub async fn stop_and_join(&self) {
        let _ = self.cancel_tx.send(true);
        // unblock a paused loop so it can observe the cancellation
        let _ = self.pause_tx.send(false);

        if let Some(handle) = self.task.lock().await.take() {
            let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(service = %self.name, error = %e, "Service task join failed")
                }
                Err(_) => {
                    tracing::warn!(service = %self.name, "Service task did not stop in time")
                }
            }
        }

        if self.state() != ServiceState::Error {
            self.set_state(ServiceState::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let core = ServiceCore::new("svc");
        assert_eq!(core.state(), ServiceState::Stopped);
        assert!(core.transition_to_running());
        assert!(!core.transition_to_running());
        assert_eq!(core.state(), ServiceState::Running);

        core.pause();
        assert_eq!(core.state(), ServiceState::Paused);
        core.resume();
        assert_eq!(core.state(), ServiceState::Running);
    }

    #[tokio::test]
    async fn test_pause_only_from_running() {
        let core = ServiceCore::new("svc");
        core.pause();
        assert_eq!(core.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_error_state_survives_stop() {
        let core = ServiceCore::new("svc");
        assert!(core.transition_to_running());
        core.set_state(ServiceState::Error);
        core.stop_and_join().await;
        assert_eq!(core.state(), ServiceState::Error);
    }

    #[tokio::test]
    async fn test_wait_if_paused_unblocks_on_resume() {
        let core = Arc::new(ServiceCore::new("svc"));
        assert!(core.transition_to_running());
        core.pause();

        let waiter = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                core.wait_if_paused().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        core.resume();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("resume must unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_and_join_awaits_task() {
        let core = Arc::new(ServiceCore::new("svc"));
        assert!(core.transition_to_running());
        let mut cancel = core.cancel_rx();
        core.attach_task(tokio::spawn(async move {
            let _ = cancel.changed().await;
        }))
        .await;

        core.stop_and_join().await;
        assert_eq!(core.state(), ServiceState::Stopped);
    }
}
