//! Timer registry polled by the test coordinator.
//!
//! Timers are plain data: the coordinator asks for the next deadline, sleeps
//! until then (or until a socket becomes ready), and calls [`Timers::run`]
//! to learn which timers fired. Periodic timers are rearmed from their
//! previous expiry so reports do not drift.

use std::time::{Duration, Instant};

/// What a timer is for; the coordinator dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// End of a duration-bounded test
    Duration,
    /// Per-interval statistics snapshot
    Stats,
    /// Per-interval report output
    Reporter,
    /// End of the omit (warm-up) period
    Omit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone)]
struct Timer {
    id: TimerId,
    kind: TimerKind,
    expiry: Instant,
    period: Option<Duration>,
}

/// Time-ordered set of armed timers.
///
/// # Examples
///
/// ```
/// use rsperf::timer::{TimerKind, Timers};
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let mut timers = Timers::new();
/// timers.add(TimerKind::Stats, start, Duration::from_secs(1), true);
/// timers.add(TimerKind::Duration, start, Duration::from_secs(3), false);
///
/// let fired = timers.run(start + Duration::from_secs(1));
/// assert_eq!(fired.len(), 1);
/// assert_eq!(fired[0].1, TimerKind::Stats);
/// ```
#[derive(Debug, Default)]
pub struct Timers {
    // Sorted by expiry, ties in insertion order.
    timers: Vec<Timer>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer that first fires `delay` after `now`.
    pub fn add(&mut self, kind: TimerKind, now: Instant, delay: Duration, periodic: bool) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.insert(Timer {
            id,
            kind,
            expiry: now + delay,
            period: periodic.then_some(delay),
        });
        id
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Earliest deadline, if any timer is armed.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.timers.first().map(|t| t.expiry)
    }

    /// Fires every timer due at `now`, in expiry order.
    ///
    /// One-shot timers are removed. A periodic timer fires at most once per
    /// call and is rearmed one period after its previous expiry.
    pub fn run(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let due = self.timers.partition_point(|t| t.expiry <= now);
        let fired: Vec<Timer> = self.timers.drain(..due).collect();

        let mut out = Vec::with_capacity(fired.len());
        for mut timer in fired {
            out.push((timer.id, timer.kind));
            if let Some(period) = timer.period {
                timer.expiry += period;
                self.insert(timer);
            }
        }
        out
    }

    fn insert(&mut self, timer: Timer) {
        let pos = self.timers.partition_point(|t| t.expiry <= timer.expiry);
        self.timers.insert(pos, timer);
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
