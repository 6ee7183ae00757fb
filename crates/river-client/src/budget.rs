//! Leaky-bucket connection retry budget with exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

/// Knobs for the retry budget.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub base_interval_ms: u64,
    pub max_jitter_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_budget_capacity: u32,
    pub budget_restore_interval_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            base_interval_ms: 150,
            max_jitter_ms: 200,
            max_backoff_ms: 32_000,
            attempt_budget_capacity: 5,
            budget_restore_interval_ms: 200,
        }
    }
}

/// Leaky bucket of connection attempts.
///
/// Each attempt consumes one unit of budget; after a successful
/// connection the budget drains back one unit per restore interval.
pub struct RetryBudget {
    options: RetryOptions,
    consumed: Arc<AtomicU32>,
    restore_task: Option<JoinHandle<()>>,
}

impl RetryBudget {
    pub fn new(options: RetryOptions) -> Self {
        RetryBudget {
            options,
            consumed: Arc::new(AtomicU32::new(0)),
            restore_task: None,
        }
    }

    pub fn has_budget(&self) -> bool {
        self.consumed.load(Ordering::SeqCst) < self.options.attempt_budget_capacity
    }

    pub fn consumed(&self) -> u32 {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Backoff before the next attempt: 0 on a fresh bucket, otherwise
    /// `base * 2^(consumed-1)` capped at the max, plus uniform jitter.
    pub fn backoff_ms(&self) -> u64 {
        let consumed = self.consumed.load(Ordering::SeqCst);
        if consumed == 0 {
            return 0;
        }
        let exponent = consumed - 1;
        let factor = 1u64.checked_shl(exponent.min(63)).unwrap_or(u64::MAX);
        let backoff = self
            .options
            .base_interval_ms
            .saturating_mul(factor)
            .min(self.options.max_backoff_ms);
        backoff + rand::thread_rng().gen_range(0..=self.options.max_jitter_ms)
    }

    /// Consume one attempt and stop any running restoration.
    pub fn consume(&mut self) {
        self.stop_restoring();
        self.consumed.fetch_add(1, Ordering::SeqCst);
    }

    /// Gradually restore budget after a successful connection.
    pub fn start_restoring(&mut self) {
        self.stop_restoring();
        let consumed = self.consumed.clone();
        let interval = Duration::from_millis(self.options.budget_restore_interval_ms);
        self.restore_task = Some(tokio::spawn(async move {
            while consumed.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(interval).await;
                let _ = consumed.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                    c.checked_sub(1)
                });
            }
        }));
    }

    pub fn reset(&mut self) {
        self.stop_restoring();
        self.consumed.store(0, Ordering::SeqCst);
    }

    fn stop_restoring(&mut self) {
        if let Some(task) = self.restore_task.take() {
            task.abort();
        }
    }
}

impl Drop for RetryBudget {
    fn drop(&mut self) {
        self.stop_restoring();
    }
}
