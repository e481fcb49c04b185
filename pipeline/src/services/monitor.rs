//! Resource monitoring
//!
//! Every resource carries a [`ResourceMonitor`]: cumulative atomic counters,
//! fixed-size sliding-window rate trackers, and a bounded operational error
//! log. Recording is O(1) regardless of traffic; reading is a snapshot of
//! atomics. A resource is healthy exactly when its error log is empty.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::constants::{ERROR_LOG_CAPACITY, METRICS_WINDOW_BUCKETS};
use crate::utils::time::now_ms;

/// Per-usage-type health view of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsageState {
    #[default]
    Active,
    /// Transient pressure (queue full/empty, waiting on upstream).
    Waiting,
    /// Operational fault.
    Failed,
}

impl std::fmt::Display for UsageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageState::Active => write!(f, "active"),
            UsageState::Waiting => write!(f, "waiting"),
            UsageState::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded operational error.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub code: &'static str,
    pub message: String,
    pub details: String,
}

/// Sliding-window rate tracker with a fixed number of buckets.
///
/// Each bucket covers `bucket_ms`; recording stamps the bucket with its
/// window index and resets stale counts in place, so memory never grows with
/// traffic. The stamp race between two recorders is benign: the loser adds
/// to a freshly reset bucket of the same index.
struct RateWindow {
    buckets: Vec<Bucket>,
    bucket_ms: i64,
}

struct Bucket {
    stamp: AtomicI64,
    count: AtomicU64,
}

impl RateWindow {
    fn new(window_ms: u64) -> Self {
        let bucket_ms = (window_ms as i64 / METRICS_WINDOW_BUCKETS as i64).max(1);
        Self {
            buckets: (0..METRICS_WINDOW_BUCKETS)
                .map(|_| Bucket {
                    stamp: AtomicI64::new(-1),
                    count: AtomicU64::new(0),
                })
                .collect(),
            bucket_ms,
        }
    }

    fn record(&self, n: u64) {
        let stamp = now_ms() / self.bucket_ms;
        let bucket = &self.buckets[(stamp as usize) % self.buckets.len()];
        if bucket.stamp.load(Ordering::Relaxed) != stamp {
            bucket.count.store(0, Ordering::Relaxed);
            bucket.stamp.store(stamp, Ordering::Relaxed);
        }
        bucket.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Events per second over the live portion of the window.
    fn per_second(&self) -> f64 {
        let current = now_ms() / self.bucket_ms;
        let oldest_live = current - self.buckets.len() as i64 + 1;
        let total: u64 = self
            .buckets
            .iter()
            .filter(|b| b.stamp.load(Ordering::Relaxed) >= oldest_live)
            .map(|b| b.count.load(Ordering::Relaxed))
            .sum();
        let window_secs = (self.bucket_ms * self.buckets.len() as i64) as f64 / 1_000.0;
        total as f64 / window_secs
    }
}

/// Counters, rates, usage states and the bounded error log of one resource.
pub struct ResourceMonitor {
    name: String,
    window_ms: u64,
    counters: DashMap<&'static str, AtomicU64>,
    rates: DashMap<&'static str, RateWindow>,
    usage_states: DashMap<String, UsageState>,
    errors: Mutex<VecDeque<ErrorRecord>>,
}

impl ResourceMonitor {
    pub fn new(name: impl Into<String>, window_ms: u64) -> Self {
        Self {
            name: name.into(),
            window_ms,
            counters: DashMap::new(),
            rates: DashMap::new(),
            usage_states: DashMap::new(),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Increment a cumulative counter.
    pub fn increment(&self, counter: &'static str) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: &'static str, n: u64) {
        self.counters
            .entry(counter)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
        self.rates
            .entry(counter)
            .or_insert_with(|| RateWindow::new(self.window_ms))
            .record(n);
    }

    /// Current value of a cumulative counter.
    pub fn counter(&self, counter: &'static str) -> u64 {
        self.counters
            .get(counter)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record an operational error: bounded log plus WARN.
    pub fn record_error(&self, code: &'static str, message: &str, details: impl Into<String>) {
        let details = details.into();
        tracing::warn!(resource = %self.name, code, message, details = %details, "Operational error");
        let mut errors = self.errors.lock();
        if errors.len() >= ERROR_LOG_CAPACITY {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            at: Utc::now(),
            code,
            message: message.to_string(),
            details,
        });
        self.increment("error_count");
    }

    /// Last recorded errors, oldest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().iter().cloned().collect()
    }

    /// Healthy ⇔ no recorded errors.
    pub fn is_healthy(&self) -> bool {
        self.errors.lock().is_empty()
    }

    pub fn set_usage_state(&self, usage_type: &str, state: UsageState) {
        self.usage_states.insert(usage_type.to_string(), state);
    }

    pub fn usage_state(&self, usage_type: &str) -> UsageState {
        self.usage_states
            .get(usage_type)
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Snapshot of all counters and window rates.
    pub fn metrics(&self) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        for entry in self.counters.iter() {
            out.insert(
                entry.key().to_string(),
                entry.value().load(Ordering::Relaxed) as f64,
            );
        }
        for entry in self.rates.iter() {
            out.insert(
                format!("{}_per_sec", entry.key()),
                entry.value().per_second(),
            );
        }
        out.insert("error_log_len".to_string(), self.errors.lock().len() as f64);
        out
    }
}
