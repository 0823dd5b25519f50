//! Admission control: a per-connection token bucket, per-handler sliding
//! windows, and a process-wide concurrency gate.
//!
//! The token bucket fast path is atomic; contention only appears on refill,
//! where a single CAS winner credits the elapsed interval. The per-handler
//! windows follow the hit-queue shape used for scope-keyed limiting, and the
//! concurrency gate is a plain semaphore whose permits ride through the
//! middleware stack into the handler.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-connection token bucket. Tokens refill continuously at
/// `refill_per_sec`, capped at `capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_per_sec: u32,
    tokens: AtomicU32,
    last_refill_ms: AtomicU64,
    origin: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: AtomicU32::new(capacity),
            last_refill_ms: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    /// Take one token. Returns false when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(1)
            })
            .is_ok()
    }

    fn refill(&self) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let last_ms = self.last_refill_ms.load(Ordering::Acquire);
        let credit = (now_ms.saturating_sub(last_ms) * self.refill_per_sec as u64) / 1000;
        if credit == 0 {
            return;
        }
        // One winner credits the interval; losers retry on their next call.
        if self
            .last_refill_ms
            .compare_exchange(last_ms, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let capacity = self.capacity;
            let _ = self
                .tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                    Some(capacity.min(tokens.saturating_add(credit.min(u32::MAX as u64) as u32)))
                });
        }
    }

}

/// Static per-handler limit: at most `max_calls` within `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRate {
    pub max_calls: u32,
    pub window: Duration,
}

/// Sliding-window state, keyed per opcode. One instance lives on each
/// connection.
#[derive(Debug, Default)]
pub struct RateWindows {
    states: Mutex<HashMap<u16, VecDeque<Instant>>>,
}

impl RateWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call against `opcode` and report whether it stays within
    /// `limit`.
    pub fn check(&self, opcode: u16, limit: HandlerRate) -> bool {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let hits = states.entry(opcode).or_default();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) > limit.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() < limit.max_calls as usize {
            hits.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Process-wide cap on in-flight handler executions.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    /// Claim a slot without waiting. The permit releases on drop, after the
    /// handler completes.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_within_capacity() {
        let bucket = TokenBucket::new(2, 1);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(1, 1000);
        assert!(bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn refill_caps_at_capacity() {
        let bucket = TokenBucket::new(3, 100);
        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn window_blocks_after_max_calls() {
        let windows = RateWindows::new();
        let limit = HandlerRate {
            max_calls: 2,
            window: Duration::from_millis(100),
        };
        assert!(windows.check(1, limit));
        assert!(windows.check(1, limit));
        assert!(!windows.check(1, limit));
    }

    #[test]
    fn window_recovers_after_expiry() {
        let windows = RateWindows::new();
        let limit = HandlerRate {
            max_calls: 1,
            window: Duration::from_millis(20),
        };
        assert!(windows.check(1, limit));
        assert!(!windows.check(1, limit));
        std::thread::sleep(Duration::from_millis(30));
        assert!(windows.check(1, limit));
    }

    #[test]
    fn windows_are_per_opcode() {
        let windows = RateWindows::new();
        let limit = HandlerRate {
            max_calls: 1,
            window: Duration::from_secs(60),
        };
        assert!(windows.check(1, limit));
        assert!(windows.check(2, limit));
        assert!(!windows.check(1, limit));
    }

    #[test]
    fn gate_caps_inflight() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.try_acquire().expect("first");
        let _b = gate.try_acquire().expect("second");
        assert!(gate.try_acquire().is_none());
        drop(a);
        assert!(gate.try_acquire().is_some());
    }
}
