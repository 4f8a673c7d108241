//! Sliding-window rate limiting.
//!
//! Each key maps to a small ring of time buckets covering the last window.
//! Admission sums the ring; advancing the ring drops expired buckets
//! wholesale, so both operations are O(buckets) with a small constant.
//!
//! The map is shared across sessions. All read-modify-write operations on
//! one key's ring run under that key's shard lock, and the sweep takes the
//! same locks, so removal can never race an increment.

use std::{
    fmt::Display,
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use postern_common::clock::Clock;

use crate::store::RateLimitStore;

const BUCKETS: usize = 16;

/// One slot more than the bucket count, so a bucket is dropped only once it
/// lies entirely outside the window. Admission may briefly count events
/// slightly older than the window (conservative), but can never miss an
/// event inside it.
const SLOTS: usize = BUCKETS + 1;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    Allowed,
    Denied,
}

#[derive(Debug, Clone)]
struct Ring {
    counts: [u32; SLOTS],
    /// Slice index of the newest bucket, `counts[head_slice % SLOTS]`.
    head_slice: u64,
    total: u32,
}

impl Ring {
    fn new(slice: u64) -> Self {
        Self {
            counts: [0; SLOTS],
            head_slice: slice,
            total: 0,
        }
    }

    /// Rotate the ring forward, zeroing buckets that fell out of the window.
    fn advance(&mut self, slice: u64) {
        if slice <= self.head_slice {
            return;
        }

        let shift = slice - self.head_slice;
        if shift >= SLOTS as u64 {
            self.counts = [0; SLOTS];
            self.total = 0;
        } else {
            for step in 1..=shift {
                let idx = ((self.head_slice + step) % SLOTS as u64) as usize;
                self.total -= self.counts[idx];
                self.counts[idx] = 0;
            }
        }
        self.head_slice = slice;
    }

    fn increment(&mut self) {
        let idx = (self.head_slice % SLOTS as u64) as usize;
        self.counts[idx] += 1;
        self.total += 1;
    }

    const fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Sliding-window counter map keyed by peer address or username.
///
/// Counters are created on first event and released by [`sweep`] once their
/// whole ring has expired.
///
/// [`sweep`]: RateLimiter::sweep
#[derive(Debug)]
pub struct RateLimiter<K: Eq + Hash + Clone + Display> {
    rings: DashMap<K, Ring, ahash::RandomState>,
    limit: u32,
    slice_width: Duration,
    origin: Instant,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn RateLimitStore>>,
}

impl<K: Eq + Hash + Clone + Display> RateLimiter<K> {
    pub fn new(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        // Never let a slice collapse to zero width.
        let slice_width = (window / BUCKETS as u32).max(Duration::from_millis(1));

        Self {
            rings: DashMap::default(),
            limit,
            slice_width,
            origin: clock.monotonic(),
            clock,
            store: None,
        }
    }

    /// Attach an optional persistence contract. Allowed events are recorded
    /// through it and expiries forwarded on sweep.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn current_slice(&self) -> u64 {
        let elapsed = self.clock.monotonic().duration_since(self.origin);
        (elapsed.as_millis() / self.slice_width.as_millis().max(1)) as u64
    }

    /// Count an event against `key` if the window still has room.
    ///
    /// A `limit` of 0 disables the limiter entirely.
    pub fn check_and_increment(&self, key: K) -> RateVerdict {
        if self.limit == 0 {
            return RateVerdict::Allowed;
        }

        let slice = self.current_slice();
        let mut entry = self
            .rings
            .entry(key.clone())
            .or_insert_with(|| Ring::new(slice));
        entry.advance(slice);

        if entry.total < self.limit {
            entry.increment();
            drop(entry);

            if let Some(store) = self.store.as_ref() {
                store.record(&key.to_string(), self.clock.wall());
            }

            RateVerdict::Allowed
        } else {
            RateVerdict::Denied
        }
    }

    /// Number of events currently inside the window for `key`.
    pub fn occupancy(&self, key: &K) -> u32 {
        let slice = self.current_slice();
        self.rings.get_mut(key).map_or(0, |mut entry| {
            entry.advance(slice);
            entry.total
        })
    }

    /// Drop every key whose ring is entirely stale.
    pub fn sweep(&self) {
        let slice = self.current_slice();
        self.rings.retain(|_, ring| {
            ring.advance(slice);
            !ring.is_empty()
        });

        if let Some(store) = self.store.as_ref() {
            let window = self.slice_width * BUCKETS as u32;
            store.expire_before(self.clock.wall() - window);
        }
    }

    /// Number of live counters, for observability.
    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::{net::IpAddr, sync::Arc, time::Duration};

    use postern_common::clock::ManualClock;

    use super::{RateLimiter, RateVerdict};

    fn limiter(limit: u32, window_s: u64) -> (RateLimiter<IpAddr>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(limit, Duration::from_secs(window_s), clock.clone());
        (limiter, clock)
    }

    fn peer() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    #[test]
    fn allows_up_to_limit_then_denies() {
        let (limiter, _clock) = limiter(5, 60);

        for _ in 0..5 {
            assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);
        }
        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Denied);
        assert_eq!(limiter.occupancy(&peer()), 5);
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let (limiter, clock) = limiter(3, 60);

        for _ in 0..3 {
            assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);
        }
        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Denied);

        // Expiry is bucket-granular: capacity frees within one slice past
        // the window, never before the window has fully passed.
        clock.advance(Duration::from_secs(65));
        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);
    }

    #[test]
    fn partial_expiry_is_gradual() {
        let (limiter, clock) = limiter(2, 64);

        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);

        // Half a window later the first event still counts.
        clock.advance(Duration::from_secs(32));
        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);
        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Denied);

        // Another half window (plus a slice of expiry slack) drops the
        // first event only.
        clock.advance(Duration::from_secs(37));
        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);
    }

    #[test]
    fn never_more_than_limit_in_any_rolling_window() {
        let (limiter, clock) = limiter(10, 60);
        let mut allowed_at = Vec::new();
        let mut now = 0u64;

        // Hammer the limiter once a second for five minutes.
        for _ in 0..300 {
            if limiter.check_and_increment(peer()) == RateVerdict::Allowed {
                allowed_at.push(now);
            }
            clock.advance(Duration::from_secs(1));
            now += 1;
        }

        for (i, &t) in allowed_at.iter().enumerate() {
            let in_window = allowed_at[..=i]
                .iter()
                .filter(|&&earlier| t - earlier < 60)
                .count();
            assert!(in_window <= 10, "{in_window} events inside 60s ending {t}");
        }
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _clock) = limiter(1, 60);
        let other: IpAddr = "5.6.7.8".parse().unwrap();

        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);
        assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Denied);
        assert_eq!(limiter.check_and_increment(other), RateVerdict::Allowed);
    }

    #[test]
    fn sweep_drops_stale_counters() {
        let (limiter, clock) = limiter(5, 60);

        limiter.check_and_increment(peer());
        assert_eq!(limiter.len(), 1);

        limiter.sweep();
        assert_eq!(limiter.len(), 1, "live counters survive the sweep");

        clock.advance(Duration::from_secs(120));
        limiter.sweep();
        assert!(limiter.is_empty());
    }

    #[test]
    fn zero_limit_disables() {
        let (limiter, _clock) = limiter(0, 60);
        for _ in 0..1000 {
            assert_eq!(limiter.check_and_increment(peer()), RateVerdict::Allowed);
        }
    }
}
