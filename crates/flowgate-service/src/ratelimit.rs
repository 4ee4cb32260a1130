//! Per-identity request throttling.
//!
//! Fixed-window buckets on monotonic time: the first request in a window
//! starts it, the next `capacity - 1` pass, everything further in that
//! window is rejected. A full quiet window resets the bucket. Wall-clock
//! changes cannot widen or shrink the window because only `Instant`s are
//! compared.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flowgate_common::{consts, Error, Result};

struct Bucket {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: u32,
    window: Duration,
    ops: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(consts::RATE_LIMIT_CAPACITY, consts::RATE_LIMIT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            window,
            ops: AtomicU64::new(0),
        }
    }

    /// Charges one request to `identity`.
    pub fn check(&self, identity: &str) -> Result<()> {
        self.check_at(identity, Instant::now())
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> Result<()> {
        let mut buckets = self.buckets.lock().unwrap();

        if self.ops.fetch_add(1, Ordering::Relaxed) % consts::RATE_LIMIT_PRUNE_EVERY == 0 {
            let horizon = self.window * 2;
            buckets.retain(|_, bucket| now.duration_since(bucket.window_start) < horizon);
        }

        let bucket = buckets.entry(identity.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
        });
        if now.duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        if bucket.count >= self.capacity {
            return Err(Error::RateLimited {
                identity: identity.to_string(),
            });
        }
        bucket.count += 1;
        Ok(())
    }

    #[cfg(test)]
    fn tracked_identities(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}
