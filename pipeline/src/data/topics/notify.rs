//! Insert-notification registry
//!
//! Readers do not poll the database for new messages: every committed
//! publish offers the new row id onto a bounded wake-up queue, and every
//! reader of the topic blocks on that queue. Queues live in a process-wide
//! registry keyed by `(topic_name, schema_name)` so that notifications never
//! leak between runs sharing one database.
//!
//! Registry lifecycle: an entry is created lazily by the first delegate that
//! binds the `(topic, schema)` pair and removed when the owning topic
//! resource closes. A publish that finds no registered queue (shutdown race)
//! drops the event with a debug log; the message itself is durable and will
//! be picked up by the next scan.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::constants::WAKEUP_QUEUE_CAPACITY;

/// Bounded queue of freshly inserted row ids.
pub struct WakeQueue {
    ids: Mutex<VecDeque<i64>>,
    notify: Notify,
    capacity: usize,
}

impl WakeQueue {
    fn new(capacity: usize) -> Self {
        Self {
            ids: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Offer a row id; drops the id when the queue is full.
    ///
    /// A dropped wake-up is harmless for correctness: the row is durable and
    /// any subsequent wake-up triggers a scan that starts at the oldest
    /// claimable id.
    pub fn offer(&self, id: i64) -> bool {
        let accepted = {
            let mut ids = self.ids.lock();
            if ids.len() >= self.capacity {
                false
            } else {
                ids.push_back(id);
                true
            }
        };
        if accepted {
            self.notify.notify_one();
        } else {
            tracing::debug!(id, "Wake-up queue full, dropping notification");
        }
        accepted
    }

    /// Take the next row id, waiting up to `timeout` for one to arrive.
    pub async fn take(&self, timeout: Duration) -> Option<i64> {
        let deadline = Instant::now() + timeout;
        loop {
            // create the future before checking the queue so a concurrent
            // offer between check and await cannot be missed
            let notified = self.notify.notified();

            if let Some(id) = self.ids.lock().pop_front() {
                return Some(id);
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.ids.lock().pop_front();
            }
        }
    }

    /// Number of queued wake-ups (monitoring only).
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide registry of wake-up queues.
pub struct NotificationHub {
    queues: DashMap<(String, String), Arc<WakeQueue>>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Get or lazily create the queue for a `(topic, schema)` key.
    pub fn register(&self, topic: &str, schema: &str) -> Arc<WakeQueue> {
        self.queues
            .entry((topic.to_string(), schema.to_string()))
            .or_insert_with(|| Arc::new(WakeQueue::new(WAKEUP_QUEUE_CAPACITY)))
            .clone()
    }

    /// Offer a freshly inserted row id to the registered queue, if any.
    pub fn offer(&self, topic: &str, schema: &str, id: i64) {
        match self.queues.get(&(topic.to_string(), schema.to_string())) {
            Some(queue) => {
                queue.offer(id);
            }
            None => {
                tracing::debug!(topic, schema, id, "No wake-up queue registered, dropping event");
            }
        }
    }

    /// Remove a registration (topic close).
    pub fn remove(&self, topic: &str, schema: &str) {
        self.queues.remove(&(topic.to_string(), schema.to_string()));
    }

    /// Number of registered keys (monitoring only).
    pub fn registered(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_take() {
        let queue = WakeQueue::new(8);
        assert!(queue.offer(41));
        assert_eq!(queue.take(Duration::from_millis(10)).await, Some(41));
    }

    #[tokio::test]
    async fn test_take_times_out_empty() {
        let queue = WakeQueue::new(8);
        assert_eq!(queue.take(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn test_take_wakes_on_concurrent_offer() {
        let queue = Arc::new(WakeQueue::new(8));
        let taker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.offer(7);
        assert_eq!(taker.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_bounded_drops_when_full() {
        let queue = WakeQueue::new(2);
        assert!(queue.offer(1));
        assert!(queue.offer(2));
        assert!(!queue.offer(3));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_hub_register_shares_queue() {
        let hub = NotificationHub::new();
        let a = hub.register("batches", "sim_r1");
        let b = hub.register("batches", "sim_r1");
        assert!(Arc::ptr_eq(&a, &b));

        let other_schema = hub.register("batches", "sim_r2");
        assert!(!Arc::ptr_eq(&a, &other_schema));
    }

    #[tokio::test]
    async fn test_hub_offer_unregistered_is_dropped() {
        let hub = NotificationHub::new();
        // must not panic, message stays durable in the database
        hub.offer("batches", "sim_r1", 9);
        assert_eq!(hub.registered(), 0);
    }

    #[tokio::test]
    async fn test_hub_offer_reaches_queue() {
        let hub = NotificationHub::new();
        let queue = hub.register("batches", "sim_r1");
        hub.offer("batches", "sim_r1", 5);
        assert_eq!(queue.take(Duration::from_millis(10)).await, Some(5));
    }

    #[tokio::test]
    async fn test_hub_remove() {
        let hub = NotificationHub::new();
        hub.register("batches", "sim_r1");
        hub.remove("batches", "sim_r1");
        assert_eq!(hub.registered(), 0);
    }
}
