//! Queue capability
//!
//! Bounded in-process queues between the engine and the persistence
//! service. Wrapped per binding: input handles expose poll/take/drain,
//! output handles expose offer/put. Backpressure surfaces as the `Waiting`
//! usage state on the owning resource; ordering is FIFO per
//! producer-consumer pair.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use super::monitor::{ResourceMonitor, UsageState};
use crate::services::binding::{USAGE_QUEUE_IN, USAGE_QUEUE_OUT};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,

    #[error("queue full")]
    Full,

    #[error("offer timed out")]
    Timeout,
}

/// A named bounded queue; create input/output handles per binding.
pub struct QueueResource<T> {
    name: String,
    tx: mpsc::Sender<T>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    monitor: Arc<ResourceMonitor>,
}

impl<T: Send + 'static> QueueResource<T> {
    pub fn new(name: impl Into<String>, capacity: usize, monitor: Arc<ResourceMonitor>) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Output handle for a producer binding.
    pub fn output(&self) -> QueueSender<T> {
        QueueSender {
            tx: self.tx.clone(),
            monitor: Arc::clone(&self.monitor),
        }
    }

    /// Input handle for the consumer binding.
    ///
    /// The receiving side is single-consumer; the second taker gets `None`.
    pub fn input(&self) -> Option<QueueReceiver<T>> {
        self.rx.lock().take().map(|rx| QueueReceiver {
            rx,
            monitor: Arc::clone(&self.monitor),
        })
    }
}

/// Producer-side queue handle.
#[derive(Clone)]
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    monitor: Arc<ResourceMonitor>,
}

impl<T: Send + 'static> QueueSender<T> {
    /// Non-blocking offer; `Full` marks the resource `Waiting`.
    pub fn offer(&self, item: T) -> Result<(), QueueError> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.monitor.set_usage_state(USAGE_QUEUE_OUT, UsageState::Active);
                self.monitor.increment("queue_offered");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.monitor.set_usage_state(USAGE_QUEUE_OUT, UsageState::Waiting);
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.monitor.set_usage_state(USAGE_QUEUE_OUT, UsageState::Failed);
                Err(QueueError::Closed)
            }
        }
    }

    /// Blocking put; waits for capacity.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        if self.tx.capacity() == 0 {
            self.monitor.set_usage_state(USAGE_QUEUE_OUT, UsageState::Waiting);
        }
        let result = self.tx.send(item).await.map_err(|_| QueueError::Closed);
        match &result {
            Ok(()) => self.monitor.set_usage_state(USAGE_QUEUE_OUT, UsageState::Active),
            Err(_) => self.monitor.set_usage_state(USAGE_QUEUE_OUT, UsageState::Failed),
        }
        if result.is_ok() {
            self.monitor.increment("queue_offered");
        }
        result
    }

    /// Offer with a bounded wait.
    pub async fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        match tokio::time::timeout(timeout, self.put(item)).await {
            Ok(result) => result,
            Err(_) => {
                self.monitor.set_usage_state(USAGE_QUEUE_OUT, UsageState::Waiting);
                Err(QueueError::Timeout)
            }
        }
    }

    /// Put every item, in order.
    pub async fn put_all(&self, items: impl IntoIterator<Item = T>) -> Result<(), QueueError> {
        for item in items {
            self.put(item).await?;
        }
        Ok(())
    }

    /// Offer items until the first failure; returns how many were accepted.
    pub fn offer_all(&self, items: impl IntoIterator<Item = T>) -> usize {
        let mut accepted = 0;
        for item in items {
            if self.offer(item).is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    }
}

/// Consumer-side queue handle.
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    monitor: Arc<ResourceMonitor>,
}

impl<T: Send + 'static> QueueReceiver<T> {
    /// Non-blocking poll.
    pub fn poll(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.monitor.set_usage_state(USAGE_QUEUE_IN, UsageState::Active);
                self.monitor.increment("queue_taken");
                Some(item)
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                self.monitor.set_usage_state(USAGE_QUEUE_IN, UsageState::Waiting);
                None
            }
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.monitor.set_usage_state(USAGE_QUEUE_IN, UsageState::Failed);
                None
            }
        }
    }

    /// Blocking take; `None` when every sender is gone.
    pub async fn take(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        match &item {
            Some(_) => {
                self.monitor.set_usage_state(USAGE_QUEUE_IN, UsageState::Active);
                self.monitor.increment("queue_taken");
            }
            None => self.monitor.set_usage_state(USAGE_QUEUE_IN, UsageState::Failed),
        }
        item
    }

    /// Take with a bounded wait.
    pub async fn poll_timeout(&mut self, timeout: Duration) -> Option<T> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(item) => {
                if item.is_some() {
                    self.monitor.set_usage_state(USAGE_QUEUE_IN, UsageState::Active);
                    self.monitor.increment("queue_taken");
                }
                item
            }
            Err(_) => {
                self.monitor.set_usage_state(USAGE_QUEUE_IN, UsageState::Waiting);
                None
            }
        }
    }

    /// Drain up to `max` immediately available items into `sink`.
    pub fn drain_to(&mut self, sink: &mut Vec<T>, max: usize) -> usize {
        let mut drained = 0;
        while drained < max {
            match self.rx.try_recv() {
                Ok(item) => {
                    sink.push(item);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        if drained > 0 {
            self.monitor.add("queue_taken", drained as u64);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::DEFAULT_METRICS_WINDOW_MS;

    fn queue(capacity: usize) -> QueueResource<i64> {
        QueueResource::new(
            "engine-queue",
            capacity,
            Arc::new(ResourceMonitor::new("engine-queue", DEFAULT_METRICS_WINDOW_MS)),
        )
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue(16);
        let out = q.output();
        let mut input = q.input().unwrap();

        out.put_all([1, 2, 3]).await.unwrap();
        assert_eq!(input.take().await, Some(1));
        assert_eq!(input.take().await, Some(2));
        assert_eq!(input.take().await, Some(3));
    }

    #[tokio::test]
    async fn test_input_is_single_consumer() {
        let q = queue(4);
        assert!(q.input().is_some());
        assert!(q.input().is_none());
    }

    #[tokio::test]
    async fn test_offer_full_sets_waiting() {
        let q = queue(1);
        let out = q.output();
        out.offer(1).unwrap();
        assert!(matches!(out.offer(2), Err(QueueError::Full)));
        assert_eq!(
            q.monitor.usage_state(USAGE_QUEUE_OUT),
            UsageState::Waiting
        );
    }

    #[tokio::test]
    async fn test_poll_empty_sets_waiting() {
        let q = queue(4);
        let mut input = q.input().unwrap();
        assert_eq!(input.poll(), None);
        assert_eq!(q.monitor.usage_state(USAGE_QUEUE_IN), UsageState::Waiting);
    }

    #[tokio::test]
    async fn test_poll_timeout_returns_none() {
        let q = queue(4);
        let mut input = q.input().unwrap();
        assert_eq!(input.poll_timeout(Duration::from_millis(30)).await, None);
    }

    #[tokio::test]
    async fn test_offer_timeout_expires() {
        let q = queue(1);
        let out = q.output();
        out.offer(1).unwrap();
        assert!(matches!(
            out.offer_timeout(2, Duration::from_millis(30)).await,
            Err(QueueError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_drain_to_respects_max() {
        let q = queue(16);
        let out = q.output();
        let mut input = q.input().unwrap();

        out.put_all([1, 2, 3, 4, 5]).await.unwrap();
        let mut sink = Vec::new();
        assert_eq!(input.drain_to(&mut sink, 3), 3);
        assert_eq!(sink, vec![1, 2, 3]);
        assert_eq!(input.drain_to(&mut sink, 10), 2);
        assert_eq!(sink, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_offer_all_counts_accepted() {
        let q = queue(2);
        let out = q.output();
        assert_eq!(out.offer_all([1, 2, 3]), 2);
    }
}
