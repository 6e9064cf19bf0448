//! Minimum-interval rate limiter shared by every task talking to one exchange.
//!
//! The limiter is an explicit object rather than global state: tasks that
//! must share a budget share an `Arc<RateLimiter>`, tasks with independent
//! budgets get their own.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Block the calling thread until a request may be issued, then claim the
    /// slot. Returns how long the caller waited.
    ///
    /// The lock is held across the sleep so concurrent callers queue up
    /// behind each other instead of all waking at the same instant.
    pub fn acquire(&self) -> Duration {
        let mut last = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        let waited = match *last {
            Some(prev) => {
                let ready_at = prev + self.min_interval;
                let now = Instant::now();
                if ready_at > now {
                    let wait = ready_at - now;
                    trace!(wait_ms = wait.as_millis() as u64, "rate limiter sleeping");
                    std::thread::sleep(wait);
                    wait
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };
        *last = Some(Instant::now());
        waited
    }
}
