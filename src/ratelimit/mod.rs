use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Idle buckets sitting at full capacity for this long become eligible for
/// reaping (§4.3: `T_idle >= 5 min`).
const GC_IDLE_SECS: u64 = 300;
/// How often the reaper task sweeps the map.
const GC_INTERVAL_SECS: u64 = 60;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// The refill/decrement step in isolation, so it can be driven with
/// controlled timestamps in tests without sleeping real wall-clock time.
struct BucketState {
    tokens: f64,
    last_refill_us: u64,
}

impl BucketState {
    fn new(capacity: f64, now: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_us: now,
        }
    }

    /// Refills up to `capacity` at `rate_per_sec`, then admits iff at least
    /// one token remains. Matches §4.3's algorithm exactly: refill before
    /// testing, never after.
    fn admit_at(&mut self, now: u64, capacity: f64, rate_per_sec: f64) -> bool {
        let elapsed_secs = now.saturating_sub(self.last_refill_us) as f64 / 1_000_000.0;
        self.tokens = (self.tokens + elapsed_secs * rate_per_sec).min(capacity);
        self.last_refill_us = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_idle_and_full(&self, capacity: f64, now: u64) -> bool {
        self.tokens >= capacity && now.saturating_sub(self.last_refill_us) >= GC_IDLE_SECS * 1_000_000
    }
}

struct Bucket {
    state: Mutex<BucketState>,
    last_access_us: AtomicU64,
}

/// Per-client-IP token bucket rate limiter (§4.3). Keyed exclusively by
/// `client_ip` — narrower than a general route/host keyed limiter, since
/// §3's data model names exactly one state shape: `client-IP -> bucket`.
///
/// Per-key exclusion with cross-key parallelism: each IP's bucket has its
/// own `tokio::sync::Mutex`, held only across the refill-and-decrement
/// step, so concurrent admissions for distinct IPs never serialize on each
/// other (§5).
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Arc<Bucket>>,
    capacity: f64,
    rate_per_sec: f64,
    reaper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    /// `requests_per_minute` is `C` in §4.3; the refill rate is fixed at
    /// `C / 60` tokens per second.
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = requests_per_minute as f64;
        Self {
            buckets: DashMap::new(),
            capacity,
            rate_per_sec: capacity / 60.0,
            reaper: std::sync::Mutex::new(None),
        }
    }

    /// Admits or denies one request from `ip`. Buckets are created lazily,
    /// full, on first sight of a key.
    pub async fn admit(&self, ip: IpAddr) -> bool {
        let bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| {
                let now = now_us();
                Arc::new(Bucket {
                    state: Mutex::new(BucketState::new(self.capacity, now)),
                    last_access_us: AtomicU64::new(now),
                })
            })
            .clone();

        let now = now_us();
        bucket.last_access_us.store(now, Ordering::Relaxed);
        let mut state = bucket.state.lock().await;
        state.admit_at(now, self.capacity, self.rate_per_sec)
    }

    /// Removes buckets sitting at full capacity, untouched for `T_idle`.
    /// A brief race that re-creates a full bucket for a key reaped just as
    /// a new request lands is acceptable per §4.3.
    fn reap(&self) {
        let now = now_us();
        self.buckets.retain(|_, bucket| {
            match bucket.state.try_lock() {
                Ok(state) => !state.is_idle_and_full(self.capacity, now),
                // Held by an in-flight admit — definitely not idle, keep it.
                Err(_) => true,
            }
        });
    }

    /// Spawns the background reaper task. Call once after construction. The
    /// task's `JoinHandle` is stored alongside the limiter and aborted on
    /// `Drop`, so a config reload that swaps in a fresh `RateLimiter` doesn't
    /// leave the old one's reaper running forever — it stops as soon as the
    /// last `Arc` reference to the old limiter (held by in-flight requests
    /// using the outgoing snapshot) goes away.
    pub fn start_reaper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.reap();
            }
        });
        *self.reaper.lock().unwrap() = Some(handle);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_allows_exactly_capacity_bursts() {
        let mut state = BucketState::new(5.0, 0);
        for _ in 0..5 {
            assert!(state.admit_at(0, 5.0, 5.0 / 60.0));
        }
        assert!(!state.admit_at(0, 5.0, 5.0 / 60.0), "6th burst must be denied");
    }

    #[test]
    fn empty_bucket_refills_after_enough_time() {
        let rate_per_sec = 60.0 / 60.0; // C = 60 => 1 token/sec
        let mut state = BucketState::new(60.0, 0);
        for _ in 0..60 {
            assert!(state.admit_at(0, 60.0, rate_per_sec));
        }
        assert!(!state.admit_at(0, 60.0, rate_per_sec), "bucket just drained");

        // 60/C seconds later (1s), exactly one token refills.
        assert!(state.admit_at(1_000_000, 60.0, rate_per_sec));
        assert!(!state.admit_at(1_000_000, 60.0, rate_per_sec));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut state = BucketState::new(10.0, 0);
        // A huge time jump must still cap at capacity, not overflow it.
        assert!(state.admit_at(1_000_000_000_000, 10.0, 10.0 / 60.0));
        assert!((state.tokens - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn admit_is_keyed_independently_per_ip() {
        let limiter = RateLimiter::new(1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.admit(a).await);
        assert!(!limiter.admit(a).await, "a's single token is spent");
        assert!(limiter.admit(b).await, "b has its own independent bucket");
    }

    #[test]
    fn idle_full_bucket_is_reapable_only_after_t_idle() {
        let state = BucketState {
            tokens: 5.0,
            last_refill_us: 0,
        };
        assert!(!state.is_idle_and_full(5.0, 299 * 1_000_000));
        assert!(state.is_idle_and_full(5.0, 300 * 1_000_000));
    }

    #[test]
    fn non_full_bucket_is_never_reaped_regardless_of_age() {
        let state = BucketState {
            tokens: 4.9,
            last_refill_us: 0,
        };
        assert!(!state.is_idle_and_full(5.0, 10_000 * 1_000_000));
    }

    #[tokio::test]
    async fn reap_is_a_no_op_on_buckets_that_were_just_created() {
        let limiter = RateLimiter::new(5);
        let active: IpAddr = "10.0.0.4".parse().unwrap();
        assert!(limiter.admit(active).await);

        limiter.reap();
        assert_eq!(limiter.bucket_count(), 1);
        assert!(limiter.buckets.contains_key(&active));
    }
}
