//! Tick buffering
//!
//! Accumulates decoded ticks between receives and decides when a flush is
//! due: either the size threshold is reached or the oldest pending tick has
//! been waiting longer than the flush timeout. Single producer, single
//! consumer - the indexer main loop owns the buffer exclusively.

use std::time::Duration;

use tokio::time::Instant;

use crate::wire::TickData;

pub struct TickBuffer {
    ticks: Vec<TickData>,
    first_pending_at: Option<Instant>,
    insert_batch_size: usize,
    flush_timeout: Duration,
}

impl TickBuffer {
    pub fn new(insert_batch_size: usize, flush_timeout: Duration) -> Self {
        Self {
            ticks: Vec::with_capacity(insert_batch_size),
            first_pending_at: None,
            insert_batch_size: insert_batch_size.max(1),
            flush_timeout,
        }
    }

    pub fn offer(&mut self, tick: TickData) {
        if self.ticks.is_empty() {
            self.first_pending_at = Some(Instant::now());
        }
        self.ticks.push(tick);
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// A flush is due on size or on age of the oldest pending tick.
    pub fn flush_due(&self) -> bool {
        if self.ticks.len() >= self.insert_batch_size {
            return true;
        }
        match self.first_pending_at {
            Some(at) => !self.ticks.is_empty() && at.elapsed() >= self.flush_timeout,
            None => false,
        }
    }

    /// Time until the pending ticks age out, used to bound the receive wait.
    pub fn time_to_deadline(&self) -> Option<Duration> {
        self.first_pending_at
            .map(|at| self.flush_timeout.saturating_sub(at.elapsed()))
    }

    /// Take everything, resetting the age tracking.
    pub fn take(&mut self) -> Vec<TickData> {
        self.first_pending_at = None;
        std::mem::take(&mut self.ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(n: i64) -> TickData {
        TickData {
            tick_number: n,
            ..Default::default()
        }
    }

    #[test]
    fn test_flush_on_size() {
        let mut buffer = TickBuffer::new(3, Duration::from_secs(60));
        buffer.offer(tick(0));
        buffer.offer(tick(1));
        assert!(!buffer.flush_due());
        buffer.offer(tick(2));
        assert!(buffer.flush_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_timeout() {
        let mut buffer = TickBuffer::new(1_000, Duration::from_millis(100));
        buffer.offer(tick(0));
        assert!(!buffer.flush_due());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(buffer.flush_due());
    }

    #[test]
    fn test_empty_never_due() {
        let buffer = TickBuffer::new(1, Duration::from_millis(0));
        assert!(!buffer.flush_due());
        assert!(buffer.time_to_deadline().is_none());
    }

    #[test]
    fn test_take_resets() {
        let mut buffer = TickBuffer::new(2, Duration::from_secs(60));
        buffer.offer(tick(0));
        buffer.offer(tick(1));
        assert!(buffer.flush_due());

        let taken = buffer.take();
        assert_eq!(taken.len(), 2);
        assert!(buffer.is_empty());
        assert!(!buffer.flush_due());
        assert!(buffer.time_to_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_tracks_oldest_tick() {
        let mut buffer = TickBuffer::new(1_000, Duration::from_millis(100));
        buffer.offer(tick(0));
        tokio::time::advance(Duration::from_millis(40)).await;
        buffer.offer(tick(1));

        let remaining = buffer.time_to_deadline().unwrap();
        assert!(remaining <= Duration::from_millis(60));
    }
}
