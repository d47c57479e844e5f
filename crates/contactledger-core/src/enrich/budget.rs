//! Per-source request budgets.
//!
//! A [`RateBudget`] keeps the admission times of the last `limit` calls and
//! admits a new call only when fewer than `limit` calls fall inside the
//! trailing window. Any window of that length therefore contains at most
//! `limit` calls, no matter how they are spread.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::retry::sleep_or_cancel;

/// Sliding-window call budget.
#[derive(Debug, Clone)]
pub struct RateBudget {
    limit: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl RateBudget {
    /// Allows `limit` calls per `window`. A zero limit is treated as one.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX).max(1);
        Self {
            limit,
            window,
            admitted: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    /// Budget described by a config entry.
    #[must_use]
    pub fn from_config(config: RateLimitConfig) -> Self {
        Self::new(config.limit, config.window)
    }

    /// Calls allowed per window.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Calls admitted within the window ending at `now`.
    pub fn calls_in_window(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.admitted.len()
    }

    /// Start of the current window: the oldest admission still counted.
    #[must_use]
    pub fn window_start(&self) -> Option<Instant> {
        self.admitted.front().copied()
    }

    /// Admits a call at `now`, or returns how long to wait before trying again.
    ///
    /// # Errors
    ///
    /// Returns the wait until the oldest counted call leaves the window.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        self.expire(now);
        if self.admitted.len() < self.limit {
            self.admitted.push_back(now);
            return Ok(());
        }
        let oldest = self.admitted.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.saturating_duration_since(oldest)))
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// A [`RateBudget`] shared by the concurrent callers of one source.
#[derive(Debug)]
pub struct RateLimiter {
    source: String,
    budget: Mutex<RateBudget>,
}

impl RateLimiter {
    /// Creates a limiter for `source`.
    #[must_use]
    pub fn new(source: impl Into<String>, budget: RateBudget) -> Self {
        Self {
            source: source.into(),
            budget: Mutex::new(budget),
        }
    }

    /// Waits until a call may be made. Returns false if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            let wait = {
                let mut budget = self.budget.lock().await;
                match budget.try_admit(Instant::now()) {
                    Ok(()) => return true,
                    Err(wait) => wait,
                }
            };
            debug!(
                source = %self.source,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "rate budget exhausted, waiting"
            );
            // A zero wait still yields, so other tasks can make progress.
            if !sleep_or_cancel(wait.max(Duration::from_millis(1)), cancel).await {
                return false;
            }
        }
    }
}
