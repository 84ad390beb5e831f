//! Retry scheduling
//!
//! One priority queue of `{due_at, instance_id, step_id}` drained by the
//! scheduler pool. Delays follow exponential back-off with jitter to avoid
//! thundering herds.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Notify;

use conflux_domain::InstanceId;

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential back-off: `delay = min(max, base * 2^prior_retries)` with
/// ±10% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Delay before the retry following `prior_retries` failed attempts
    #[must_use]
    pub fn delay_for(&self, prior_retries: u32) -> Duration {
        let exponent = prior_retries.min(31);
        let raw = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        let capped = raw.min(self.max_delay);

        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }
        let spread = capped.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(300))
    }
}

// =============================================================================
// Retry Queue
// =============================================================================

/// A retry waiting to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub due_at: DateTime<Utc>,
    pub instance_id: InstanceId,
    pub step_id: String,
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then_with(|| self.instance_id.cmp(&other.instance_id))
            .then_with(|| self.step_id.cmp(&other.step_id))
    }
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending retries, drained by the scheduler pool
pub struct RetryQueue {
    heap: Mutex<BinaryHeap<Reverse<ScheduledRetry>>>,
    notify: Notify,
}

impl RetryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a retry and wake the drainer
    pub fn push(&self, retry: ScheduledRetry) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.push(Reverse(retry));
        }
        self.notify.notify_one();
    }

    /// Pop every retry that is due at `now`
    #[must_use]
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<ScheduledRetry> {
        let mut due = Vec::new();
        if let Ok(mut heap) = self.heap.lock() {
            while heap.peek().is_some_and(|Reverse(r)| r.due_at <= now) {
                if let Some(Reverse(r)) = heap.pop() {
                    due.push(r);
                }
            }
        }
        due
    }

    /// Next deadline, if any
    #[must_use]
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap
            .lock()
            .ok()
            .and_then(|heap| heap.peek().map(|Reverse(r)| r.due_at))
    }

    /// Drop all pending retries (engine stop)
    pub fn clear(&self) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.clear();
        }
        self.notify.notify_one();
    }

    /// Wait until woken by a push or until the duration elapses
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().map(|h| h.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}
