//! Send-rate pacing, server bitrate limiting and stall detection.
//!
//! ## Per-stream pacing
//!
//! A sender may transmit while its achieved rate since the start of the
//! stream is below the target: `bytes_sent * 8 / elapsed < rate`. The check
//! is a plain comparison; a throttled sender skips sending for one pacing
//! period instead of sleeping until a computed deadline.
//!
//! ## Aggregate bitrate limit
//!
//! The server keeps a ring of per-interval byte totals covering the
//! averaging window. Once the ring is full, the mean over the window is
//! compared to the limit on every interval; the first excess latches.
//!
//! ## Idle detection
//!
//! [`IdleWatch`] remembers when a byte counter last moved.

use std::time::{Duration, Instant};

/// Batch size used by unthrottled senders without a fixed burst.
pub const DEFAULT_MULTISEND: u32 = 10;

/// Number of sends a worker attempts per scheduling quantum.
///
/// A fixed burst wins; otherwise unlimited senders batch and rate-limited
/// senders send one block at a time so the throttle is rechecked after
/// every send.
pub fn multisend_batch(burst: u32, rate: u64) -> u32 {
    if burst > 0 {
        burst
    } else if rate == 0 {
        DEFAULT_MULTISEND
    } else {
        1
    }
}

/// Achieved-rate check for one sending stream.
///
/// # Examples
///
/// ```
/// use rsperf::pacing::Throttle;
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let throttle = Throttle::new(8_000_000, start); // 1 MB/s
///
/// // 500 KB after one second is under the target.
/// assert!(throttle.green_light(500_000, start + Duration::from_secs(1)));
/// // 2 MB after one second is over it.
/// assert!(!throttle.green_light(2_000_000, start + Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    /// Target bits per second, 0 = unlimited
    pub rate: u64,
    start: Instant,
}

impl Throttle {
    pub fn new(rate: u64, start: Instant) -> Self {
        Self { rate, start }
    }

    pub fn is_limited(&self) -> bool {
        self.rate > 0
    }

    /// Whether the stream may send given `bytes_sent` since `start`.
    pub fn green_light(&self, bytes_sent: u64, now: Instant) -> bool {
        if self.rate == 0 {
            return true;
        }
        let seconds = now.saturating_duration_since(self.start).as_secs_f64();
        if seconds <= 0.0 {
            return bytes_sent == 0;
        }
        let bits_per_second = bytes_sent as f64 * 8.0 / seconds;
        bits_per_second < self.rate as f64
    }
}

/// Server-side aggregate bitrate limit over a sliding window.
///
/// # Examples
///
/// ```
/// use rsperf::pacing::BitrateLimiter;
/// use std::time::Duration;
///
/// // 1 Mbit/s averaged over 3 one-second intervals.
/// let mut limiter = BitrateLimiter::new(1_000_000, Duration::from_secs(3), Duration::from_secs(1));
/// assert_eq!(limiter.record(1_000_000), None); // window not full yet
/// assert_eq!(limiter.record(1_000_000), None);
/// assert!(limiter.record(1_000_000).is_some()); // 8 Mbit/s sustained
/// assert!(limiter.exceeded());
/// ```
#[derive(Debug, Clone)]
pub struct BitrateLimiter {
    limit: u64,
    stats_interval: Duration,
    interval_bytes: Vec<u64>,
    last_index: usize,
    count: usize,
    exceeded: bool,
}

impl BitrateLimiter {
    /// Sizes the ring as `window / stats_interval` slots, at least one.
    pub fn new(limit: u64, window: Duration, stats_interval: Duration) -> Self {
        let slots = if stats_interval.is_zero() || window <= stats_interval {
            1
        } else {
            (window.as_secs_f64() / stats_interval.as_secs_f64()).round() as usize
        };
        Self {
            limit,
            stats_interval,
            interval_bytes: vec![0; slots.max(1)],
            last_index: slots.max(1) - 1,
            count: 0,
            exceeded: false,
        }
    }

    pub fn window_slots(&self) -> usize {
        self.interval_bytes.len()
    }

    pub fn exceeded(&self) -> bool {
        self.exceeded
    }

    /// Records one interval's aggregate bytes.
    ///
    /// Returns the averaged rate the first time it exceeds the limit, and
    /// `None` on every other call, including all calls after the latch.
    pub fn record(&mut self, bytes: u64) -> Option<u64> {
        if self.limit == 0 || self.exceeded {
            return None;
        }

        self.last_index = (self.last_index + 1) % self.interval_bytes.len();
        self.interval_bytes[self.last_index] = bytes;

        self.count += 1;
        if self.count < self.interval_bytes.len() {
            return None;
        }

        let total: u64 = self.interval_bytes.iter().sum();
        let seconds = self.stats_interval.as_secs_f64() * self.interval_bytes.len() as f64;
        if seconds <= 0.0 {
            return None;
        }
        let bits_per_second = (total as f64 * 8.0 / seconds) as u64;
        if bits_per_second > self.limit {
            self.exceeded = true;
            Some(bits_per_second)
        } else {
            None
        }
    }
}

/// Tracks how long a monotonically growing counter has been still.
#[derive(Debug, Clone)]
pub struct IdleWatch {
    timeout: Duration,
    last_value: u64,
    last_change: Instant,
}

impl IdleWatch {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_value: 0,
            last_change: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restarts the idle clock without requiring the counter to move.
    pub fn touch(&mut self, value: u64, now: Instant) {
        self.last_value = value;
        self.last_change = now;
    }

    /// Feeds the current counter value; true once it has not moved for
    /// longer than the timeout.
    pub fn observe(&mut self, value: u64, now: Instant) -> bool {
        if value != self.last_value {
            self.touch(value, now);
            return false;
        }
        !self.timeout.is_zero() && now.saturating_duration_since(self.last_change) > self.timeout
    }

    /// When the watch would expire if the counter stays still.
    pub fn deadline(&self) -> Option<Instant> {
        (!self.timeout.is_zero()).then(|| self.last_change + self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_multisend_batch() {
        assert_eq!(multisend_batch(0, 0), DEFAULT_MULTISEND);
        assert_eq!(multisend_batch(0, 1_000_000), 1);
        assert_eq!(multisend_batch(5, 1_000_000), 5);
        assert_eq!(multisend_batch(5, 0), 5);
    }

    #[test]
    fn test_unlimited_is_always_green() {
        let t0 = Instant::now();
        let throttle = Throttle::new(0, t0);
        assert!(!throttle.is_limited());
        assert!(throttle.green_light(u64::MAX / 16, t0));
    }

    #[test]
    fn test_green_light_tracks_average() {
        let t0 = Instant::now();
        let throttle = Throttle::new(1_000_000, t0);
        // Exactly on target is red.
        assert!(!throttle.green_light(125_000, t0 + SEC));
        assert!(throttle.green_light(124_999, t0 + SEC));
        // Falls back to green as time passes.
        assert!(throttle.green_light(125_000, t0 + 2 * SEC));
    }

    #[test]
    fn test_bitrate_transient_excess_does_not_abort() {
        // 5 s window, 1 s ticks, 10 Mbit/s limit.
        let mut limiter = BitrateLimiter::new(10_000_000, 5 * SEC, SEC);
        assert_eq!(limiter.window_slots(), 5);

        let low = 500_000; // 4 Mbit/s
        let high = 2_500_000; // 20 Mbit/s
        // Four ticks of excess never fill the window.
        for bytes in [high, high, high, high] {
            assert_eq!(limiter.record(bytes), None);
        }

        // Isolated spikes keep every full window under the limit.
        let mut limiter = BitrateLimiter::new(10_000_000, 5 * SEC, SEC);
        for bytes in [high, low, low, low, low, high, low, low, low, low] {
            assert_eq!(limiter.record(bytes), None);
        }
        assert!(!limiter.exceeded());
    }

    #[test]
    fn test_bitrate_sustained_excess_triggers_once() {
        let mut limiter = BitrateLimiter::new(10_000_000, 5 * SEC, SEC);
        let high = 2_500_000;
        let fired: Vec<_> = (0..10).filter_map(|_| limiter.record(high)).collect();
        assert_eq!(fired, vec![20_000_000]);
        assert!(limiter.exceeded());
    }

    #[test]
    fn test_bitrate_ring_wraps() {
        let mut limiter = BitrateLimiter::new(10_000_000, 2 * SEC, SEC);
        let high = 2_500_000;
        assert_eq!(limiter.record(0), None);
        assert_eq!(limiter.record(0), None);
        assert_eq!(limiter.record(high), None); // (0 + 20M) / 2 = 10M, not above
        assert!(limiter.record(high).is_some()); // oldest zero overwritten
    }

    #[test]
    fn test_bitrate_disabled() {
        let mut limiter = BitrateLimiter::new(0, 5 * SEC, SEC);
        for _ in 0..10 {
            assert_eq!(limiter.record(u64::MAX / 16), None);
        }
    }

    #[test]
    fn test_window_smaller_than_interval() {
        let limiter = BitrateLimiter::new(1, SEC, 2 * SEC);
        assert_eq!(limiter.window_slots(), 1);
    }

    #[test]
    fn test_idle_watch() {
        let t0 = Instant::now();
        let mut watch = IdleWatch::new(2 * SEC, t0);
        assert!(!watch.observe(0, t0 + SEC));
        assert!(!watch.observe(100, t0 + 3 * SEC));
        assert!(!watch.observe(100, t0 + 5 * SEC));
        assert!(watch.observe(100, t0 + 5 * SEC + Duration::from_millis(1)));
        assert_eq!(watch.deadline(), Some(t0 + 5 * SEC));
    }

    #[test]
    fn test_idle_watch_disabled() {
        let t0 = Instant::now();
        let mut watch = IdleWatch::new(Duration::ZERO, t0);
        assert!(!watch.observe(0, t0 + 1000 * SEC));
        assert_eq!(watch.deadline(), None);
    }
}
